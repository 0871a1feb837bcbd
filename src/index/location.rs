use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cfg::ImportRef;
use crate::error::{AnalysisError, Result};
use crate::history::{python_package_filter, FileHistoryTracker};
use crate::resolver::{native_module_names, ModuleKey};
use crate::trie::Trie;
use crate::value::{Concrete, Value, ValueKind};

/// Coarse classification of an exported symbol, for display and for
/// ranking fix candidates against how the missing name is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolType {
    Type,
    Function,
    Assignment,
    Module,
    Unknown,
    Ambiguous,
}

impl SymbolType {
    pub fn from_value(value: &Value) -> SymbolType {
        match value.kind() {
            ValueKind::Concrete(Concrete::Class(_)) => SymbolType::Type,
            ValueKind::Concrete(Concrete::Function(_)) => SymbolType::Function,
            ValueKind::Concrete(Concrete::Module(_)) => SymbolType::Module,
            ValueKind::Concrete(_) => SymbolType::Assignment,
            ValueKind::Native(_) => SymbolType::Function,
            ValueKind::Unknown(_) => SymbolType::Unknown,
            ValueKind::Fuzzy(_) => SymbolType::Ambiguous,
        }
    }
}

impl std::fmt::Display for SymbolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SymbolType::Type => "type",
            SymbolType::Function => "function",
            SymbolType::Assignment => "assignment",
            SymbolType::Module => "module",
            SymbolType::Unknown => "unknown",
            SymbolType::Ambiguous => "ambiguous",
        };
        f.write_str(s)
    }
}

/// One exporting module's record for a symbol name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub symbol_type: SymbolType,
    /// The symbol is the module itself (`import x`), not a member.
    pub is_module_itself: bool,
    /// Some indexed file imports this symbol.
    pub imported: bool,
    pub import_count: u32,
    /// The module stopped exporting the symbol, but imports of it still
    /// exist; kept so those imports keep resolving until they go away.
    pub not_yet_found_in_module: bool,
}

impl SymbolEntry {
    fn new(symbol_type: SymbolType, is_module_itself: bool) -> SymbolEntry {
        SymbolEntry {
            symbol_type,
            is_module_itself,
            imported: false,
            import_count: 0,
            not_yet_found_in_module: false,
        }
    }
}

/// A hit for a symbol lookup within one location.
#[derive(Debug, Clone)]
pub struct SymbolMatch {
    pub module_key: ModuleKey,
    pub symbol_type: SymbolType,
    pub import_count: u32,
    pub is_module_itself: bool,
    pub not_yet_found_in_module: bool,
    /// Set when the query matched an alias; holds the real name.
    pub alias_of: Option<String>,
}

/// Compact hex digest used for location directories and per-file import
/// snapshots.
pub fn path_digest(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// On-disk form of a location: module keys are stored once in a table
/// and referenced by index from the symbol and alias maps.
#[derive(Serialize, Deserialize)]
struct SerializedLocation {
    root: PathBuf,
    is_builtins: bool,
    module_keys: Vec<ModuleKey>,
    symbols: Vec<(String, Vec<(u32, SymbolEntry)>)>,
    aliases: Vec<(String, Vec<(u32, String, u32)>)>,
    symbol_trie: Trie<()>,
}

/// Symbol records for one indexed directory tree, persisted under its
/// own subdirectory of the index.
pub struct LocationIndex {
    root: PathBuf,
    save_dir: PathBuf,
    is_builtins: bool,
    symbols: HashMap<String, HashMap<ModuleKey, SymbolEntry>>,
    /// alias name -> (module key, real name) -> import count
    aliases: HashMap<String, HashMap<(ModuleKey, String), u32>>,
    /// Symbol names with accumulated import popularity, for prefix
    /// completion.
    symbol_trie: Trie<()>,
    fht: FileHistoryTracker,
    modified_since_save: bool,
}

impl LocationIndex {
    pub fn new(root: PathBuf, save_dir: PathBuf) -> LocationIndex {
        let fht = FileHistoryTracker::new(save_dir.join("fht.bin"));
        LocationIndex {
            root,
            save_dir,
            is_builtins: false,
            symbols: HashMap::new(),
            aliases: HashMap::new(),
            symbol_trie: Trie::new(),
            fht,
            modified_since_save: true,
        }
    }

    /// The synthetic location holding the standard library: every native
    /// module is indexed as an importable symbol.
    pub fn builtins(save_dir: PathBuf) -> LocationIndex {
        let mut location = LocationIndex::new(PathBuf::new(), save_dir);
        location.is_builtins = true;
        for name in native_module_names() {
            let key = ModuleKey::Native(name.to_string());
            let mut entry = SymbolEntry::new(SymbolType::Module, true);
            entry.imported = false;
            location
                .symbols
                .entry(name.to_string())
                .or_default()
                .insert(key, entry);
            location.note_symbol(name, 0);
        }
        location
    }

    pub fn load(save_dir: PathBuf) -> Result<LocationIndex> {
        let index_path = save_dir.join("index.bin");
        let bytes = fs::read(&index_path)?;
        let serialized: SerializedLocation =
            bincode::deserialize(&bytes).map_err(|source| AnalysisError::IndexCorruption {
                path: index_path,
                source,
            })?;
        let fht = FileHistoryTracker::load(save_dir.join("fht.bin"))?;
        let key_at = |idx: u32| -> Result<ModuleKey> {
            serialized
                .module_keys
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| AnalysisError::ModuleUnresolvable(format!("key index {idx}")))
        };
        let mut symbols = HashMap::new();
        for (name, entries) in &serialized.symbols {
            let mut per_module = HashMap::new();
            for (idx, entry) in entries {
                per_module.insert(key_at(*idx)?, entry.clone());
            }
            symbols.insert(name.clone(), per_module);
        }
        let mut aliases: HashMap<String, HashMap<(ModuleKey, String), u32>> = HashMap::new();
        for (alias, entries) in &serialized.aliases {
            let per_target = aliases.entry(alias.clone()).or_default();
            for (idx, real, count) in entries {
                per_target.insert((key_at(*idx)?, real.clone()), *count);
            }
        }
        Ok(LocationIndex {
            root: serialized.root,
            save_dir,
            is_builtins: serialized.is_builtins,
            symbols,
            aliases,
            symbol_trie: serialized.symbol_trie,
            fht,
            modified_since_save: false,
        })
    }

    pub fn save(&mut self) -> Result<()> {
        if !self.modified_since_save {
            return Ok(());
        }
        fs::create_dir_all(&self.save_dir)?;
        let mut key_table: Vec<ModuleKey> = Vec::new();
        let mut key_ids: HashMap<ModuleKey, u32> = HashMap::new();
        let mut intern = |key: &ModuleKey| -> u32 {
            if let Some(id) = key_ids.get(key) {
                return *id;
            }
            let id = key_table.len() as u32;
            key_table.push(key.clone());
            key_ids.insert(key.clone(), id);
            id
        };
        let symbols = self
            .symbols
            .iter()
            .map(|(name, per_module)| {
                (
                    name.clone(),
                    per_module
                        .iter()
                        .map(|(key, entry)| (intern(key), entry.clone()))
                        .collect(),
                )
            })
            .collect();
        let aliases = self
            .aliases
            .iter()
            .map(|(alias, per_target)| {
                (
                    alias.clone(),
                    per_target
                        .iter()
                        .map(|((key, real), count)| (intern(key), real.clone(), *count))
                        .collect(),
                )
            })
            .collect();
        let serialized = SerializedLocation {
            root: self.root.clone(),
            is_builtins: self.is_builtins,
            module_keys: key_table,
            symbols,
            aliases,
            symbol_trie: self.symbol_trie.clone(),
        };
        fs::write(
            self.save_dir.join("index.bin"),
            bincode::serialize(&serialized)?,
        )?;
        self.fht.save()?;
        self.modified_since_save = false;
        Ok(())
    }

    /// Record a symbol in the completion trie, accumulating import
    /// popularity into its value.
    fn note_symbol(&mut self, name: &str, weight: u64) {
        let id = self.symbol_trie.add(name, weight, true);
        if self.symbol_trie.store(id).is_none() {
            self.symbol_trie.set_store(id, Some(()));
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_builtins(&self) -> bool {
        self.is_builtins
    }

    pub fn is_modified(&self) -> bool {
        self.modified_since_save
    }

    /// Scan the tree for changes since the last update. Timestamps are
    /// committed as files are consumed.
    pub fn changes(&mut self) -> Vec<(bool, PathBuf)> {
        if self.is_builtins {
            return Vec::new();
        }
        let root = self.root.clone();
        self.fht
            .modified_since(&root, python_package_filter, true)
            .collect()
    }

    /// Replace the exported-symbol set of one module. Entries that
    /// disappeared but are still imported somewhere are retained with
    /// `not_yet_found_in_module`.
    pub fn set_module_symbols(
        &mut self,
        key: &ModuleKey,
        exports: Vec<(String, SymbolType)>,
    ) {
        self.modified_since_save = true;
        let exported: HashMap<&String, &SymbolType> =
            exports.iter().map(|(n, t)| (n, t)).collect();
        // Retire stale entries first.
        let mut stale = Vec::new();
        for (name, per_module) in &mut self.symbols {
            if exported.contains_key(name) {
                continue;
            }
            if let Some(entry) = per_module.get_mut(key) {
                if entry.is_module_itself {
                    continue;
                }
                if entry.import_count > 0 {
                    entry.not_yet_found_in_module = true;
                } else {
                    per_module.remove(key);
                    if per_module.is_empty() {
                        stale.push(name.clone());
                    }
                }
            }
        }
        for name in stale {
            self.symbols.remove(&name);
        }
        for (name, symbol_type) in exports {
            let per_module = self.symbols.entry(name.clone()).or_default();
            let entry = per_module
                .entry(key.clone())
                .or_insert_with(|| SymbolEntry::new(symbol_type, false));
            entry.symbol_type = symbol_type;
            entry.not_yet_found_in_module = false;
            self.note_symbol(&name, 0);
        }
        // The module itself is importable under its basename.
        let basename = key.basename();
        let entry = self
            .symbols
            .entry(basename.clone())
            .or_default()
            .entry(key.clone())
            .or_insert_with(|| SymbolEntry::new(SymbolType::Module, true));
        entry.symbol_type = SymbolType::Module;
        entry.is_module_itself = true;
        entry.not_yet_found_in_module = false;
        self.note_symbol(&basename, 0);
    }

    /// A module was deleted. Entries still imported are retained as
    /// missing, the rest are dropped.
    pub fn retire_module(&mut self, key: &ModuleKey) {
        self.modified_since_save = true;
        let mut stale = Vec::new();
        for (name, per_module) in &mut self.symbols {
            if let Some(entry) = per_module.get_mut(key) {
                if entry.import_count > 0 {
                    entry.not_yet_found_in_module = true;
                } else {
                    per_module.remove(key);
                    if per_module.is_empty() {
                        stale.push(name.clone());
                    }
                }
            }
        }
        for name in stale {
            self.symbols.remove(&name);
        }
    }

    /// Adjust the import count of a symbol, creating the entry when an
    /// import refers to something the exports scan has not seen.
    pub fn bump_symbol(
        &mut self,
        name: &str,
        key: &ModuleKey,
        is_module_itself: bool,
        delta: i32,
    ) {
        self.modified_since_save = true;
        let mut emptied = false;
        {
            let per_module = self.symbols.entry(name.to_string()).or_default();
            let entry = per_module.entry(key.clone()).or_insert_with(|| {
                let symbol_type = if is_module_itself {
                    SymbolType::Module
                } else {
                    SymbolType::Unknown
                };
                SymbolEntry::new(symbol_type, is_module_itself)
            });
            if delta > 0 {
                entry.import_count = entry.import_count.saturating_add(delta as u32);
                entry.imported = true;
            } else {
                entry.import_count = entry.import_count.saturating_sub((-delta) as u32);
            }
            if entry.import_count == 0 && entry.not_yet_found_in_module {
                // The last import of a vanished symbol is gone; forget it.
                per_module.remove(key);
                emptied = per_module.is_empty();
            } else if entry.import_count == 0 {
                entry.imported = false;
            }
        }
        if emptied {
            self.symbols.remove(name);
        }
        if delta > 0 {
            self.note_symbol(name, delta as u64);
        }
    }

    pub fn bump_alias(&mut self, alias: &str, key: &ModuleKey, real: &str, delta: i32) {
        self.modified_since_save = true;
        let per_target = self.aliases.entry(alias.to_string()).or_default();
        let target = (key.clone(), real.to_string());
        let count = per_target.entry(target.clone()).or_insert(0);
        *count = if delta > 0 {
            count.saturating_add(delta as u32)
        } else {
            count.saturating_sub((-delta) as u32)
        };
        if *count == 0 {
            per_target.remove(&target);
            if per_target.is_empty() {
                self.aliases.remove(alias);
            }
        }
    }

    /// Direct and alias matches for one name.
    pub fn matches(&self, name: &str) -> Vec<SymbolMatch> {
        let mut out = Vec::new();
        if let Some(per_target) = self.aliases.get(name) {
            for ((key, real), count) in per_target {
                let entry = self.symbols.get(real).and_then(|m| m.get(key));
                out.push(SymbolMatch {
                    module_key: key.clone(),
                    symbol_type: entry.map(|e| e.symbol_type).unwrap_or(SymbolType::Unknown),
                    import_count: *count,
                    is_module_itself: entry.map(|e| e.is_module_itself).unwrap_or(false),
                    not_yet_found_in_module: false,
                    alias_of: Some(real.clone()),
                });
            }
        }
        if let Some(per_module) = self.symbols.get(name) {
            for (key, entry) in per_module {
                out.push(SymbolMatch {
                    module_key: key.clone(),
                    symbol_type: entry.symbol_type,
                    import_count: entry.import_count,
                    is_module_itself: entry.is_module_itself,
                    not_yet_found_in_module: entry.not_yet_found_in_module,
                    alias_of: None,
                });
            }
        }
        out
    }

    /// Indexed symbols starting with `prefix`, most imported first.
    pub fn complete(&self, prefix: &str) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .symbol_trie
            .entries_under(prefix)
            .into_iter()
            .map(|(name, id)| (name, self.symbol_trie.value(id)))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    fn snapshot_path(&self, file: &Path) -> PathBuf {
        self.save_dir.join(format!("{}.bin", path_digest(file)))
    }

    /// Imports recorded for `file` at its last indexing.
    pub fn read_import_snapshot(&self, file: &Path) -> Vec<ImportRef> {
        let path = self.snapshot_path(file);
        match fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes).unwrap_or_else(|err| {
                debug!(path = %path.display(), %err, "discarding unreadable import snapshot");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    pub fn write_import_snapshot(&mut self, file: &Path, imports: &[ImportRef]) -> Result<()> {
        fs::create_dir_all(&self.save_dir)?;
        fs::write(self.snapshot_path(file), bincode::serialize(imports)?)?;
        self.modified_since_save = true;
        Ok(())
    }

    pub fn drop_import_snapshot(&mut self, file: &Path) {
        let _ = fs::remove_file(self.snapshot_path(file));
        self.modified_since_save = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_key(name: &str) -> ModuleKey {
        ModuleKey::File(PathBuf::from(format!("/proj/{name}.py")))
    }

    fn location(dir: &TempDir) -> LocationIndex {
        LocationIndex::new(PathBuf::from("/proj"), dir.path().join("loc"))
    }

    #[test]
    fn test_set_and_match_symbols() {
        let dir = TempDir::new().unwrap();
        let mut loc = location(&dir);
        loc.set_module_symbols(
            &file_key("shapes"),
            vec![
                ("Circle".to_string(), SymbolType::Type),
                ("area".to_string(), SymbolType::Function),
            ],
        );
        let hits = loc.matches("Circle");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol_type, SymbolType::Type);
        // The module itself is importable too.
        let module_hits = loc.matches("shapes");
        assert!(module_hits.iter().any(|h| h.is_module_itself));
    }

    #[test]
    fn test_vanished_symbol_retained_while_imported() {
        let dir = TempDir::new().unwrap();
        let mut loc = location(&dir);
        let key = file_key("m");
        loc.set_module_symbols(&key, vec![("helper".to_string(), SymbolType::Function)]);
        loc.bump_symbol("helper", &key, false, 1);

        loc.set_module_symbols(&key, vec![]);
        let hits = loc.matches("helper");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].not_yet_found_in_module);

        // Last import goes away; the entry disappears with it.
        loc.bump_symbol("helper", &key, false, -1);
        assert!(loc.matches("helper").is_empty());
    }

    #[test]
    fn test_unimported_vanished_symbol_dropped_immediately() {
        let dir = TempDir::new().unwrap();
        let mut loc = location(&dir);
        let key = file_key("m");
        loc.set_module_symbols(&key, vec![("gone".to_string(), SymbolType::Assignment)]);
        loc.set_module_symbols(&key, vec![]);
        assert!(loc.matches("gone").is_empty());
    }

    #[test]
    fn test_alias_matching() {
        let dir = TempDir::new().unwrap();
        let mut loc = location(&dir);
        let key = file_key("numpy");
        loc.set_module_symbols(&key, vec![]);
        loc.bump_symbol("numpy", &key, true, 1);
        loc.bump_alias("np", &key, "numpy", 1);

        let hits = loc.matches("np");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].alias_of.as_deref(), Some("numpy"));

        loc.bump_alias("np", &key, "numpy", -1);
        assert!(loc.matches("np").is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut loc = location(&dir);
        let key = file_key("m");
        loc.set_module_symbols(&key, vec![("thing".to_string(), SymbolType::Type)]);
        loc.bump_symbol("thing", &key, false, 3);
        loc.bump_alias("t", &key, "thing", 2);
        loc.save().unwrap();

        let loaded = LocationIndex::load(dir.path().join("loc")).unwrap();
        assert_eq!(loaded.root(), Path::new("/proj"));
        let hits = loaded.matches("thing");
        assert_eq!(hits[0].import_count, 3);
        assert_eq!(loaded.matches("t")[0].import_count, 2);
        assert!(!loaded.is_modified());
    }

    #[test]
    fn test_load_corrupt_index_errors() {
        let dir = TempDir::new().unwrap();
        let loc_dir = dir.path().join("loc");
        fs::create_dir_all(&loc_dir).unwrap();
        fs::write(loc_dir.join("index.bin"), b"\x01garbage").unwrap();
        match LocationIndex::load(loc_dir) {
            Err(AnalysisError::IndexCorruption { .. }) => {}
            other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_builtins_location_lists_native_modules() {
        let dir = TempDir::new().unwrap();
        let loc = LocationIndex::builtins(dir.path().join("b"));
        assert!(loc.is_builtins());
        let hits = loc.matches("os");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_module_itself);
        assert_eq!(hits[0].module_key, ModuleKey::Native("os".to_string()));
    }

    #[test]
    fn test_completion_ranked_by_popularity() {
        let dir = TempDir::new().unwrap();
        let mut loc = location(&dir);
        let key = file_key("m");
        loc.set_module_symbols(
            &key,
            vec![
                ("parse_args".to_string(), SymbolType::Function),
                ("parse_env".to_string(), SymbolType::Function),
            ],
        );
        loc.bump_symbol("parse_env", &key, false, 5);
        let completions = loc.complete("parse");
        assert_eq!(completions[0].0, "parse_env");
        assert!(completions.iter().any(|(n, _)| n == "parse_args"));
    }

    #[test]
    fn test_import_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut loc = location(&dir);
        let file = PathBuf::from("/proj/app.py");
        let imports = vec![ImportRef {
            path: "os".to_string(),
            name: None,
            alias: None,
        }];
        assert!(loc.read_import_snapshot(&file).is_empty());
        loc.write_import_snapshot(&file, &imports).unwrap();
        assert_eq!(loc.read_import_snapshot(&file), imports);
        loc.drop_import_snapshot(&file);
        assert!(loc.read_import_snapshot(&file).is_empty());
    }
}
