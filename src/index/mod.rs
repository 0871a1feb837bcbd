use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::builder::build_module;
use crate::cfg::ImportRef;
use crate::error::Result;
use crate::resolver::{ModuleKey, ModuleLoader};
use crate::trie::Trie;

mod location;

pub use location::{LocationIndex, SymbolEntry, SymbolMatch, SymbolType};

use location::path_digest;

const BUILTINS_DIR: &str = "builtins";
const FAILED_FILE: &str = "failed.bin";

/// An import-fix candidate for a missing symbol, ready to be rendered as
/// an import statement.
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub symbol: String,
    pub module: String,
    pub symbol_type: SymbolType,
    pub import_count: u32,
    /// Set when the query matched an alias of `symbol`.
    pub alias: Option<String>,
    pub is_module_itself: bool,
}

impl Suggestion {
    pub fn import_statement(&self) -> String {
        match (&self.alias, self.is_module_itself) {
            // `import pkg.sub` binds `pkg`; binding the leaf name takes
            // a from-import.
            (None, true) => match self.module.rsplit_once('.') {
                Some((parent, leaf)) if leaf == self.symbol => {
                    format!("from {parent} import {leaf}")
                }
                _ => format!("import {}", self.module),
            },
            (Some(alias), true) => format!("import {} as {}", self.module, alias),
            (None, false) => format!("from {} import {}", self.module, self.symbol),
            (Some(alias), false) => {
                format!("from {} import {} as {}", self.module, self.symbol, alias)
            }
        }
    }
}

/// The name an import statement binds in the importing module, when it
/// is statically knowable (wildcards are not).
fn import_binding(import: &ImportRef) -> Option<String> {
    if let Some(alias) = &import.alias {
        return Some(alias.clone());
    }
    match &import.name {
        Some(name) if name == "*" => None,
        Some(name) => Some(name.clone()),
        None => import
            .path
            .split('.')
            .next()
            .filter(|head| !head.is_empty())
            .map(str::to_string),
    }
}

fn trie_key(root: &Path) -> String {
    let mut key = root.to_string_lossy().into_owned();
    if !key.ends_with(std::path::MAIN_SEPARATOR) {
        key.push(std::path::MAIN_SEPARATOR);
    }
    key
}

/// Dotted module path of `key` for display, relative to the location
/// root when the module is a file.
fn dotted_module(root: &Path, key: &ModuleKey) -> String {
    match key {
        ModuleKey::Native(name) | ModuleKey::Bad(name) => name.clone(),
        ModuleKey::File(path) => {
            let relative = path.strip_prefix(root).unwrap_or(path);
            let mut parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            if let Some(last) = parts.last_mut() {
                for ext in [".py", ".pyi"] {
                    if let Some(stem) = last.strip_suffix(ext) {
                        *last = stem.to_string();
                        break;
                    }
                }
            }
            if parts.last().map(|s| s.as_str()) == Some("__init__") {
                parts.pop();
            }
            parts.join(".")
        }
    }
}

/// Persistent index of exported symbols across a set of directory trees
/// plus the standard library, with import counts mined from the indexed
/// code itself.
pub struct SymbolIndex {
    save_dir: PathBuf,
    /// Location 0 is always the builtins location.
    locations: Vec<LocationIndex>,
    /// Directory-prefix trie mapping a path to its owning location id.
    path_trie: Trie<usize>,
    /// Dotted paths that failed to resolve, memoized so repeated updates
    /// skip them.
    failed: HashSet<String>,
    failed_modified: bool,
    loader: ModuleLoader,
}

impl SymbolIndex {
    /// Load the index at `save_dir`, creating a fresh one (builtins
    /// only) when nothing is there. A corrupt location is discarded and
    /// logged; the rest of the index survives.
    pub fn open_or_create(save_dir: impl Into<PathBuf>) -> Result<SymbolIndex> {
        let save_dir = save_dir.into();
        fs::create_dir_all(&save_dir)?;
        let mut locations = Vec::new();
        let mut builtins = None;
        if save_dir.is_dir() {
            for entry in fs::read_dir(&save_dir)? {
                let entry = entry?;
                let dir = entry.path();
                if !dir.is_dir() || !dir.join("index.bin").is_file() {
                    continue;
                }
                match LocationIndex::load(dir.clone()) {
                    Ok(location) => {
                        if location.is_builtins() {
                            builtins = Some(location);
                        } else {
                            locations.push(location);
                        }
                    }
                    Err(err) => {
                        warn!(dir = %dir.display(), %err, "discarding corrupt location index");
                        let _ = fs::remove_dir_all(&dir);
                    }
                }
            }
        }
        let builtins =
            builtins.unwrap_or_else(|| LocationIndex::builtins(save_dir.join(BUILTINS_DIR)));
        let mut all = vec![builtins];
        all.extend(locations);
        let mut path_trie = Trie::new();
        for (id, location) in all.iter().enumerate() {
            if location.is_builtins() {
                continue;
            }
            let node = path_trie.add(&trie_key(location.root()), 0, false);
            path_trie.set_store(node, Some(id));
        }
        let failed = match fs::read(save_dir.join(FAILED_FILE)) {
            Ok(bytes) => bincode::deserialize(&bytes).unwrap_or_else(|err| {
                debug!(%err, "discarding unreadable failed-module memo");
                HashSet::new()
            }),
            Err(_) => HashSet::new(),
        };
        Ok(SymbolIndex {
            save_dir,
            locations: all,
            path_trie,
            failed,
            failed_modified: false,
            loader: ModuleLoader::new(),
        })
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.locations
            .iter()
            .filter(|l| !l.is_builtins())
            .map(|l| l.root().to_path_buf())
            .collect()
    }

    /// Index a directory tree, creating its location on first sight.
    /// Returns the number of files (re)indexed.
    pub fn add_location(&mut self, root: &Path) -> Result<usize> {
        let id = match self.location_id_for_root(root) {
            Some(id) => id,
            None => {
                let save_dir = self.save_dir.join(path_digest(root));
                let id = self.locations.len();
                self.locations
                    .push(LocationIndex::new(root.to_path_buf(), save_dir));
                let node = self.path_trie.add(&trie_key(root), 0, false);
                self.path_trie.set_store(node, Some(id));
                info!(root = %root.display(), "added index location");
                id
            }
        };
        self.update_location(id)
    }

    fn location_id_for_root(&self, root: &Path) -> Option<usize> {
        self.locations
            .iter()
            .position(|l| !l.is_builtins() && l.root() == root)
    }

    /// Rescan every location. Returns how many files changed.
    pub fn update_all(&mut self) -> Result<usize> {
        let mut total = 0;
        for id in 0..self.locations.len() {
            total += self.update_location(id)?;
        }
        Ok(total)
    }

    fn update_location(&mut self, id: usize) -> Result<usize> {
        let changes = self.locations[id].changes();
        let mut updated = 0;
        for (is_update, path) in changes {
            if is_update {
                self.update_file(id, &path)?;
                updated += 1;
            } else {
                self.remove_file(id, &path);
            }
        }
        Ok(updated)
    }

    fn update_file(&mut self, id: usize, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "indexing file");
        let key = ModuleKey::File(path.to_path_buf());
        self.loader.invalidate(&key);

        let mut imports = Vec::new();
        match fs::read_to_string(path) {
            Ok(source) => match build_module(&source) {
                Ok(nodes) => {
                    for node in &nodes {
                        node.collect_imports(&mut imports);
                    }
                }
                Err(err) => warn!(path = %path.display(), %err, "cannot parse for imports"),
            },
            Err(err) => warn!(path = %path.display(), %err, "cannot read for imports"),
        }

        // Names bound by the file's own import statements are the
        // imported modules' symbols, not this module's exports.
        let import_bound: HashSet<String> =
            imports.iter().filter_map(import_binding).collect();
        let exports: Vec<(String, SymbolType)> = self
            .loader
            .module_exports(&key)
            .into_iter()
            .filter(|(name, _)| !import_bound.contains(name))
            .map(|(name, value)| (name, SymbolType::from_value(&value)))
            .collect();
        self.locations[id].set_module_symbols(&key, exports);

        let previous = self.locations[id].read_import_snapshot(path);
        let file_dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
        for (import, delta) in import_deltas(&previous, &imports) {
            self.apply_import(&file_dir, &import, delta);
        }
        self.locations[id].write_import_snapshot(path, &imports)?;
        Ok(())
    }

    fn remove_file(&mut self, id: usize, path: &Path) {
        debug!(path = %path.display(), "unindexing file");
        self.loader.invalidate(&ModuleKey::File(path.to_path_buf()));
        let previous = self.locations[id].read_import_snapshot(path);
        let file_dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
        for import in &previous {
            self.apply_import(&file_dir, import, -1);
        }
        self.locations[id].drop_import_snapshot(path);
        self.locations[id].retire_module(&ModuleKey::File(path.to_path_buf()));
    }

    /// Record one import reference (or its removal) against the location
    /// that owns the imported module.
    fn apply_import(&mut self, file_dir: &Path, import: &ImportRef, delta: i32) {
        if self.failed.contains(&import.path) {
            return;
        }
        let key = ModuleLoader::resolve_key(&import.path, file_dir);
        if key.is_bad() {
            if delta > 0 {
                debug!(path = import.path, "memoizing unresolvable import");
                self.failed.insert(import.path.clone());
                self.failed_modified = true;
            }
            return;
        }
        let (symbol, symbol_key, is_module) = match &import.name {
            None => (key.basename(), key.clone(), true),
            Some(name) if name == "*" => return,
            Some(name) => {
                // `from pkg import name` may pull a member or a
                // submodule; prefer the member when the module exports
                // it.
                let exports_member = self
                    .loader
                    .module_exports(&key)
                    .iter()
                    .any(|(n, _)| n == name);
                if exports_member {
                    (name.clone(), key.clone(), false)
                } else {
                    let sub = if import.path.ends_with('.') {
                        format!("{}{}", import.path, name)
                    } else {
                        format!("{}.{}", import.path, name)
                    };
                    let sub_key = ModuleLoader::resolve_key(&sub, file_dir);
                    if sub_key.is_bad() {
                        (name.clone(), key.clone(), false)
                    } else {
                        (name.clone(), sub_key, true)
                    }
                }
            }
        };
        let Some(owner) = self.location_for_key(&symbol_key) else {
            return;
        };
        self.locations[owner].bump_symbol(&symbol, &symbol_key, is_module, delta);
        if let Some(alias) = &import.alias {
            self.locations[owner].bump_alias(alias, &symbol_key, &symbol, delta);
        }
    }

    fn location_for_key(&self, key: &ModuleKey) -> Option<usize> {
        match key {
            ModuleKey::Native(_) => Some(0),
            ModuleKey::File(path) => self.location_for_path(path),
            ModuleKey::Bad(_) => None,
        }
    }

    /// The most specific indexed location containing `path`.
    pub fn location_for_path(&self, path: &Path) -> Option<usize> {
        let key = path.to_string_lossy();
        self.path_trie
            .most_recent_ancestor_or_actual(&key, |trie, id| trie.store(id).is_some())
            .and_then(|id| self.path_trie.store(id).copied())
    }

    /// All indexed candidates for `name`, best first: highest import
    /// count wins, module display breaks ties.
    pub fn find_symbol(&self, name: &str) -> Vec<Suggestion> {
        let mut out = Vec::new();
        for location in &self.locations {
            for m in location.matches(name) {
                let (symbol, alias) = match m.alias_of {
                    Some(real) => (real, Some(name.to_string())),
                    None => (name.to_string(), None),
                };
                out.push(Suggestion {
                    module: dotted_module(location.root(), &m.module_key),
                    symbol,
                    symbol_type: m.symbol_type,
                    import_count: m.import_count,
                    alias,
                    is_module_itself: m.is_module_itself,
                });
            }
        }
        out.sort_by(|a, b| {
            b.import_count
                .cmp(&a.import_count)
                .then_with(|| a.module.cmp(&b.module))
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        out
    }

    /// Ready-to-insert import statements for a missing name.
    pub fn suggest_imports(&self, name: &str) -> Vec<String> {
        self.find_symbol(name)
            .iter()
            .map(Suggestion::import_statement)
            .collect()
    }

    /// Indexed symbols starting with `prefix` across all locations,
    /// most imported first.
    pub fn complete(&self, prefix: &str) -> Vec<(String, u64)> {
        let mut merged: HashMap<String, u64> = HashMap::new();
        for location in &self.locations {
            for (name, weight) in location.complete(prefix) {
                let slot = merged.entry(name).or_insert(0);
                *slot = (*slot).max(weight);
            }
        }
        let mut out: Vec<(String, u64)> = merged.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Persist every modified location plus the failure memo.
    pub fn save(&mut self) -> Result<()> {
        for location in &mut self.locations {
            location.save()?;
        }
        if self.failed_modified {
            fs::write(
                self.save_dir.join(FAILED_FILE),
                bincode::serialize(&self.failed)?,
            )?;
            self.failed_modified = false;
        }
        Ok(())
    }
}

/// Multiset difference between two import lists, as (import, net delta)
/// pairs.
fn import_deltas(previous: &[ImportRef], current: &[ImportRef]) -> Vec<(ImportRef, i32)> {
    let mut deltas: HashMap<&ImportRef, i32> = HashMap::new();
    for import in current {
        *deltas.entry(import).or_insert(0) += 1;
    }
    for import in previous {
        *deltas.entry(import).or_insert(0) -= 1;
    }
    deltas
        .into_iter()
        .filter(|(_, delta)| *delta != 0)
        .map(|(import, delta)| (import.clone(), delta))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn project(dir: &TempDir) -> (PathBuf, PathBuf) {
        let project = dir.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let index_dir = dir.path().join("index");
        (project, index_dir)
    }

    #[test]
    fn test_index_and_find_symbol() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "shapes.py", "class Circle:\n    pass\n\ndef area(r):\n    return r\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        let count = index.add_location(&project).unwrap();
        assert_eq!(count, 1);

        let hits = index.find_symbol("Circle");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].module, "shapes");
        assert_eq!(hits[0].symbol_type, SymbolType::Type);
        assert_eq!(hits[0].import_statement(), "from shapes import Circle");
    }

    #[test]
    fn test_module_itself_suggested_as_plain_import() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "tools.py", "x = 1\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        let suggestions = index.suggest_imports("tools");
        assert!(suggestions.contains(&"import tools".to_string()));
    }

    #[test]
    fn test_import_counts_rank_candidates() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "alpha.py", "def util():\n    pass\n");
        write(&project, "beta.py", "def util():\n    pass\n");
        // Three files import alpha's util, one imports beta's.
        write(&project, "u1.py", "from alpha import util\n");
        write(&project, "u2.py", "from alpha import util\n");
        write(&project, "u3.py", "from alpha import util\n");
        write(&project, "v1.py", "from beta import util\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        let hits = index.find_symbol("util");
        assert_eq!(hits[0].module, "alpha");
        assert_eq!(hits[0].import_count, 3);
        assert_eq!(hits[1].module, "beta");
    }

    #[test]
    fn test_alias_counted_and_suggested() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "helpers.py", "def f():\n    pass\n");
        write(&project, "app.py", "import helpers as hp\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        let hits = index.find_symbol("hp");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].import_statement(), "import helpers as hp");
    }

    #[test]
    fn test_importing_file_does_not_reexport() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "helpers.py", "def f():\n    pass\n");
        write(&project, "app.py", "from helpers import f\nimport helpers\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();

        // app.py binds f and helpers, but only helpers.py exports them.
        let hits = index.find_symbol("f");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].module, "helpers");
        let hits = index.find_symbol("helpers");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].module, "helpers");
    }

    #[test]
    fn test_submodule_suggested_as_from_import() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "pkg/__init__.py", "");
        write(&project, "pkg/helpers.py", "def f():\n    pass\n");
        write(&project, "app.py", "import pkg.helpers\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        let hits = index.find_symbol("helpers");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].module, "pkg.helpers");
        assert_eq!(hits[0].import_statement(), "from pkg import helpers");
    }

    #[test]
    fn test_stdlib_import_counted_in_builtins_location() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "app.py", "import os\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        let hits = index.find_symbol("os");
        assert!(!hits.is_empty());
        assert_eq!(hits[0].module, "os");
        assert_eq!(hits[0].import_count, 1);
    }

    #[test]
    fn test_incremental_update_touches_only_changed() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "a.py", "x = 1\n");
        let b = write(&project, "b.py", "y = 1\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        assert_eq!(index.add_location(&project).unwrap(), 2);
        assert_eq!(index.update_all().unwrap(), 0);

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&b, "y = 2\nz = 3\n").unwrap();
        assert_eq!(index.update_all().unwrap(), 1);
        assert_eq!(index.find_symbol("z").len(), 1);
    }

    #[test]
    fn test_deleted_file_retires_symbols() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        let gone = write(&project, "gone.py", "def orphan():\n    pass\n");
        write(&project, "user.py", "from gone import orphan\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        assert_eq!(index.find_symbol("orphan").len(), 1);

        fs::remove_file(&gone).unwrap();
        index.update_all().unwrap();
        // Still suggested while user.py imports it.
        let hits = index.find_symbol("orphan");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].import_count, 1);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "lib.py", "class Thing:\n    pass\n");
        write(&project, "app.py", "from lib import Thing\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        index.save().unwrap();
        drop(index);

        let mut reloaded = SymbolIndex::open_or_create(&index_dir).unwrap();
        let hits = reloaded.find_symbol("Thing");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].import_count, 1);
        // Nothing changed on disk, so an update is a no-op.
        assert_eq!(reloaded.update_all().unwrap(), 0);
    }

    #[test]
    fn test_unresolvable_import_memoized() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "app.py", "import no_such_package\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        assert!(index.failed.contains("no_such_package"));
        index.save().unwrap();

        let reloaded = SymbolIndex::open_or_create(&index_dir).unwrap();
        assert!(reloaded.failed.contains("no_such_package"));
    }

    #[test]
    fn test_package_module_display_is_dotted() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "pkg/__init__.py", "");
        write(&project, "pkg/inner.py", "def deep():\n    pass\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        let hits = index.find_symbol("deep");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].module, "pkg.inner");
        assert_eq!(hits[0].import_statement(), "from pkg.inner import deep");
    }

    #[test]
    fn test_corrupt_location_discarded_on_open() {
        let dir = TempDir::new().unwrap();
        let (project, index_dir) = project(&dir);
        write(&project, "ok.py", "x = 1\n");

        let mut index = SymbolIndex::open_or_create(&index_dir).unwrap();
        index.add_location(&project).unwrap();
        index.save().unwrap();
        drop(index);

        let bad_dir = index_dir.join(path_digest(&project));
        fs::write(bad_dir.join("index.bin"), b"\x02broken").unwrap();
        let reloaded = SymbolIndex::open_or_create(&index_dir).unwrap();
        assert!(reloaded.roots().is_empty());
    }
}
