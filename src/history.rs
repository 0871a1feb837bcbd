use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::{AnalysisError, Result};
use crate::trie::Trie;

/// Tracks the last-seen modification time of files beneath one directory
/// tree, backed by the path trie for compact storage and fast subtree
/// queries.
///
/// Directory prefixes are queried with a trailing separator so that no
/// tracked path is a string-prefix ambiguity of a sibling (`/a/b` vs
/// `/a/bc`).
#[derive(Debug)]
pub struct FileHistoryTracker {
    tracking_file: PathBuf,
    trie: Trie<f64>,
}

pub fn is_python_file(name: &str) -> bool {
    name.ends_with(".py") || name.ends_with(".pyi")
}

/// Directory filter mirroring Python's package discovery: subdirectories
/// count only when they are packages (contain `__init__.py`), files only
/// when they are Python source.
pub fn python_package_filter(parent: &Path, name: &str) -> bool {
    let full = parent.join(name);
    if full.is_dir() {
        !name.starts_with('.') && name != "__pycache__" && full.join("__init__.py").is_file()
    } else {
        is_python_file(name)
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn mtime_epoch(path: &Path) -> Option<f64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn dir_prefix(dir: &Path) -> String {
    let mut key = path_key(dir);
    if !key.ends_with(std::path::MAIN_SEPARATOR) {
        key.push(std::path::MAIN_SEPARATOR);
    }
    key
}

impl FileHistoryTracker {
    pub fn new(tracking_file: impl Into<PathBuf>) -> Self {
        FileHistoryTracker {
            tracking_file: tracking_file.into(),
            trie: Trie::new(),
        }
    }

    /// Load from `tracking_file`, creating an empty tracker when the file
    /// does not exist yet. Malformed data is a hard error: the caller
    /// rebuilds from scratch.
    pub fn load(tracking_file: impl Into<PathBuf>) -> Result<Self> {
        let tracking_file = tracking_file.into();
        if !tracking_file.exists() {
            return Ok(FileHistoryTracker::new(tracking_file));
        }
        let bytes = fs::read(&tracking_file)?;
        let trie = bincode::deserialize(&bytes).map_err(|source| AnalysisError::IndexCorruption {
            path: tracking_file.clone(),
            source,
        })?;
        Ok(FileHistoryTracker {
            tracking_file,
            trie,
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.tracking_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.tracking_file, bincode::serialize(&self.trie)?)?;
        Ok(())
    }

    pub fn update_timestamp_for_path(&mut self, path: &Path) {
        let id = self.trie.add(&path_key(path), 0, false);
        self.trie.set_store(id, Some(now_epoch()));
    }

    fn untrack(&mut self, key: &str) {
        if let Some(id) = self.trie.lookup(key) {
            self.trie.set_store(id, None);
        }
    }

    fn last_seen(&self, key: &str) -> Option<f64> {
        self.trie.lookup(key).and_then(|id| self.trie.store(id).copied())
    }

    /// Whether `path` exists and was modified after the last recorded
    /// timestamp (or has none recorded).
    pub fn has_file_changed_since_timestamp(&self, path: &Path) -> bool {
        let Some(mtime) = mtime_epoch(path) else {
            return false;
        };
        match self.last_seen(&path_key(path)) {
            Some(seen) => mtime > seen,
            None => true,
        }
    }

    /// Walk `dir` and produce `(true, path)` for every new or modified
    /// file passing `filter`, followed by `(false, path)` for every
    /// tracked file that is gone or no longer passes the filter.
    ///
    /// Every file is statted individually: directory mtimes do not
    /// reflect deep changes. With `auto_update`, the timestamp for a
    /// yielded file is recorded only after it has been yielded, so a
    /// consumer never misses a modification racing its own processing.
    pub fn modified_since<'a, F>(
        &'a mut self,
        dir: &Path,
        filter: F,
        auto_update: bool,
    ) -> ModifiedFiles<'a, F>
    where
        F: FnMut(&Path, &str) -> bool,
    {
        let stack = match fs::read_dir(dir) {
            Ok(rd) => vec![rd],
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cannot read directory, skipping scan");
                Vec::new()
            }
        };
        ModifiedFiles {
            tracker: self,
            filter,
            auto_update,
            dir_prefix: dir_prefix(dir),
            stack,
            seen: HashSet::new(),
            pending: None,
            removals: None,
        }
    }
}

/// Lazy, single-pass scan result of [`FileHistoryTracker::modified_since`].
pub struct ModifiedFiles<'a, F> {
    tracker: &'a mut FileHistoryTracker,
    filter: F,
    auto_update: bool,
    dir_prefix: String,
    stack: Vec<fs::ReadDir>,
    seen: HashSet<String>,
    /// Yielded file whose timestamp update is still owed.
    pending: Option<PathBuf>,
    removals: Option<std::vec::IntoIter<String>>,
}

impl<F> Iterator for ModifiedFiles<'_, F>
where
    F: FnMut(&Path, &str) -> bool,
{
    type Item = (bool, PathBuf);

    fn next(&mut self) -> Option<Self::Item> {
        if self.auto_update {
            if let Some(path) = self.pending.take() {
                self.tracker.update_timestamp_for_path(&path);
            }
        }

        while let Some(rd) = self.stack.last_mut() {
            let Some(entry) = rd.next() else {
                self.stack.pop();
                continue;
            };
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(%err, "unreadable directory entry, skipping");
                    continue;
                }
            };
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let parent = path.parent().unwrap_or(Path::new(""));
            if !(self.filter)(parent, &name) {
                continue;
            }
            if path.is_dir() {
                match fs::read_dir(&path) {
                    Ok(sub) => self.stack.push(sub),
                    Err(err) => warn!(dir = %path.display(), %err, "cannot descend, skipping"),
                }
                continue;
            }
            let key = path_key(&path);
            self.seen.insert(key.clone());
            if self.tracker.has_file_changed_since_timestamp(&path) {
                self.pending = Some(path.clone());
                return Some((true, path));
            }
        }

        // Walk finished: report tracked entries that vanished (or fell
        // outside the filter).
        if self.removals.is_none() {
            let gone: Vec<String> = self
                .tracker
                .trie
                .entries_under(&self.dir_prefix)
                .into_iter()
                .map(|(key, _)| key)
                .filter(|key| !self.seen.contains(key))
                .collect();
            self.removals = Some(gone.into_iter());
        }
        let key = self.removals.as_mut()?.next()?;
        if self.auto_update {
            self.tracker.untrack(&key);
        }
        Some((false, PathBuf::from(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::TempDir;

    fn any_file(_: &Path, name: &str) -> bool {
        // Directories pass, files must not be hidden.
        !name.starts_with('.')
    }

    fn collect(fht: &mut FileHistoryTracker, dir: &Path, auto_update: bool) -> Vec<(bool, PathBuf)> {
        fht.modified_since(dir, any_file, auto_update).collect()
    }

    #[test]
    fn test_untracked_missing_file_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let fht = FileHistoryTracker::new(dir.path().join("fht.bin"));
        assert!(!fht.has_file_changed_since_timestamp(&dir.path().join("ghost")));
    }

    #[test]
    fn test_touch_update_cycle() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("x");
        let mut fht = FileHistoryTracker::new(dir.path().join("fht.bin"));

        fs::write(&target, "a").unwrap();
        assert!(fht.has_file_changed_since_timestamp(&target));
        fht.update_timestamp_for_path(&target);
        assert!(!fht.has_file_changed_since_timestamp(&target));

        sleep(Duration::from_millis(20));
        fs::write(&target, "b").unwrap();
        assert!(fht.has_file_changed_since_timestamp(&target));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("x");
        let store = dir.path().join("fht.bin");
        fs::write(&target, "a").unwrap();

        let mut fht = FileHistoryTracker::new(&store);
        fht.update_timestamp_for_path(&target);
        fht.save().unwrap();

        let loaded = FileHistoryTracker::load(&store).unwrap();
        assert!(!loaded.has_file_changed_since_timestamp(&target));
    }

    #[test]
    fn test_load_missing_file_creates_empty() {
        let dir = TempDir::new().unwrap();
        let fht = FileHistoryTracker::load(dir.path().join("absent.bin")).unwrap();
        assert!(!fht.has_file_changed_since_timestamp(&dir.path().join("y")));
    }

    #[test]
    fn test_load_corrupt_file_errors() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("fht.bin");
        fs::write(&store, b"\xff\xff\xff\xff\xff\xff\xff\xff\xff").unwrap();
        match FileHistoryTracker::load(&store) {
            Err(AnalysisError::IndexCorruption { .. }) => {}
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn test_modified_since_discovers_and_settles() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("scan");
        fs::create_dir(&root).unwrap();
        let mut fht = FileHistoryTracker::new(dir.path().join("fht.bin"));

        assert!(collect(&mut fht, &root, true).is_empty());

        let shallow = root.join("x");
        fs::write(&shallow, "1").unwrap();
        assert_eq!(collect(&mut fht, &root, true), vec![(true, shallow.clone())]);

        // Deeply nested new file.
        let deep_dir = root.join("a/b/c/d");
        fs::create_dir_all(&deep_dir).unwrap();
        let deep = deep_dir.join("x");
        fs::write(&deep, "1").unwrap();
        assert_eq!(collect(&mut fht, &root, true), vec![(true, deep.clone())]);
        assert!(collect(&mut fht, &root, true).is_empty());

        // Modification shows up; without auto_update it keeps showing up.
        sleep(Duration::from_millis(20));
        fs::write(&deep, "2").unwrap();
        assert_eq!(collect(&mut fht, &root, false), vec![(true, deep.clone())]);
        assert_eq!(collect(&mut fht, &root, true), vec![(true, deep.clone())]);
        assert!(collect(&mut fht, &root, true).is_empty());
    }

    #[test]
    fn test_modified_since_reports_deletions() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("scan");
        let sub = root.join("pkg");
        fs::create_dir_all(&sub).unwrap();
        let a = root.join("a.py");
        let b = sub.join("b.py");
        fs::write(&a, "1").unwrap();
        fs::write(&b, "1").unwrap();

        let mut fht = FileHistoryTracker::new(dir.path().join("fht.bin"));
        let mut first = collect(&mut fht, &root, true);
        first.sort();
        assert_eq!(first, vec![(true, a.clone()), (true, b.clone())]);

        // Removing the whole subtree yields a deletion entry per tracked
        // file beneath it.
        fs::remove_dir_all(&sub).unwrap();
        assert_eq!(collect(&mut fht, &root, true), vec![(false, b.clone())]);
        assert!(collect(&mut fht, &root, true).is_empty());
    }

    #[test]
    fn test_filtered_out_file_counts_as_removed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("scan");
        fs::create_dir(&root).unwrap();
        let noise = root.join("notes.txt");
        fs::write(&noise, "1").unwrap();

        let mut fht = FileHistoryTracker::new(dir.path().join("fht.bin"));
        assert_eq!(collect(&mut fht, &root, true), vec![(true, noise.clone())]);

        // A stricter filter sees the tracked file as gone.
        let gone: Vec<_> = fht
            .modified_since(&root, |p, n| python_package_filter(p, n), true)
            .collect();
        assert_eq!(gone, vec![(false, noise)]);
    }

    #[test]
    fn test_python_package_filter() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("pkg")).unwrap();
        fs::write(root.join("pkg/__init__.py"), "").unwrap();
        fs::create_dir(root.join("plain")).unwrap();
        fs::write(root.join("mod.py"), "").unwrap();

        assert!(python_package_filter(root, "pkg"));
        assert!(!python_package_filter(root, "plain"));
        assert!(python_package_filter(root, "mod.py"));
        assert!(!python_package_filter(root, "README.md"));
        assert!(!python_package_filter(root, "__pycache__"));
    }
}
