use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::value::{Concrete, FuzzyBool, Value, ValueKind};

/// Identity of a module for caching and persistence. A `Bad` key records
/// a dotted path that could not be resolved, so the failure itself can
/// be cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKey {
    File(PathBuf),
    Native(String),
    Bad(String),
}

impl ModuleKey {
    pub fn is_bad(&self) -> bool {
        matches!(self, ModuleKey::Bad(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ModuleKey::File(_))
    }

    /// The unqualified module name: the file stem, or the package
    /// directory name for `__init__` files.
    pub fn basename(&self) -> String {
        match self {
            ModuleKey::File(path) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if stem == "__init__" {
                    path.parent()
                        .and_then(|p| p.file_name())
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or(stem)
                } else {
                    stem
                }
            }
            ModuleKey::Native(name) | ModuleKey::Bad(name) => name
                .rsplit('.')
                .next()
                .unwrap_or(name)
                .to_string(),
        }
    }
}

/// Standard-library modules resolved as opaque natives when no source
/// file matches.
const NATIVE_MODULES: &[&str] = &[
    "abc", "argparse", "ast", "asyncio", "base64", "binascii", "bisect", "builtins",
    "collections", "configparser", "contextlib", "copy", "csv", "ctypes", "dataclasses",
    "datetime", "decimal", "difflib", "dis", "enum", "errno", "fnmatch", "functools", "gc",
    "getpass", "glob", "gzip", "hashlib", "heapq", "html", "http", "importlib", "inspect",
    "io", "itertools", "json", "keyword", "logging", "math", "multiprocessing", "operator",
    "os", "pathlib", "pickle", "platform", "pprint", "queue", "random", "re", "secrets",
    "select", "selectors", "shutil", "signal", "socket", "sqlite3", "stat", "statistics",
    "string", "struct", "subprocess", "sys", "sysconfig", "tempfile", "textwrap",
    "threading", "time", "token", "tokenize", "traceback", "types", "typing", "unittest",
    "urllib", "uuid", "warnings", "weakref", "xml", "zipfile", "zlib",
];

/// Names bound in every Python scope without any import.
const PYTHON_BUILTINS: &[&str] = &[
    "abs", "all", "any", "ascii", "bin", "bool", "bytearray", "bytes", "callable", "chr",
    "classmethod", "compile", "complex", "delattr", "dict", "dir", "divmod", "enumerate",
    "eval", "exec", "filter", "float", "format", "frozenset", "getattr", "globals",
    "hasattr", "hash", "help", "hex", "id", "input", "int", "isinstance", "issubclass",
    "iter", "len", "list", "locals", "map", "max", "memoryview", "min", "next", "object",
    "oct", "open", "ord", "pow", "print", "property", "range", "repr", "reversed", "round",
    "set", "setattr", "slice", "sorted", "staticmethod", "str", "sum", "super", "tuple",
    "type", "vars", "zip",
    "ArithmeticError", "AssertionError", "AttributeError", "BaseException",
    "ConnectionError", "Exception", "FileExistsError", "FileNotFoundError",
    "GeneratorExit", "ImportError", "IndexError", "InterruptedError", "KeyError",
    "KeyboardInterrupt", "LookupError", "MemoryError", "ModuleNotFoundError", "NameError",
    "NotImplementedError", "OSError", "OverflowError", "PermissionError", "RecursionError",
    "RuntimeError", "StopAsyncIteration", "StopIteration", "SyntaxError", "SystemError",
    "SystemExit", "TimeoutError", "TypeError", "UnboundLocalError", "UnicodeDecodeError",
    "UnicodeEncodeError", "UnicodeError", "ValueError", "Warning", "ZeroDivisionError",
    "NotImplemented", "Ellipsis", "__name__", "__file__", "__doc__", "__debug__",
];

pub fn builtin_names() -> &'static [&'static str] {
    PYTHON_BUILTINS
}

pub fn native_module_names() -> &'static [&'static str] {
    NATIVE_MODULES
}

pub fn is_native_module(root: &str) -> bool {
    NATIVE_MODULES.contains(&root)
}

fn builtin_values() -> HashMap<String, Value> {
    PYTHON_BUILTINS
        .iter()
        .map(|name| (name.to_string(), Value::native(*name)))
        .collect()
}

struct ModuleRegistryInner {
    cache: HashMap<ModuleKey, Value>,
    in_progress: HashSet<ModuleKey>,
}

/// Session-scoped module cache. All loads for one analysis go through
/// one registry, so a module is interpreted at most once and import
/// cycles terminate.
pub struct ModuleRegistry {
    inner: ModuleRegistryInner,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            inner: ModuleRegistryInner {
                cache: HashMap::new(),
                in_progress: HashSet::new(),
            },
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        ModuleRegistry::new()
    }
}

/// Cheap clonable handle over a shared [`ModuleRegistry`], carried by
/// every frame of a session.
#[derive(Clone)]
pub struct ModuleLoader {
    registry: Rc<RefCell<ModuleRegistry>>,
    builtins: Rc<HashMap<String, Value>>,
}

impl Default for ModuleLoader {
    fn default() -> Self {
        ModuleLoader::new()
    }
}

impl ModuleLoader {
    pub fn new() -> ModuleLoader {
        ModuleLoader {
            registry: Rc::new(RefCell::new(ModuleRegistry::new())),
            builtins: Rc::new(builtin_values()),
        }
    }

    pub fn builtins(&self) -> Rc<HashMap<String, Value>> {
        Rc::clone(&self.builtins)
    }

    /// Map a dotted import path to its identity, resolving files
    /// relative to the importing file's directory. Never touches the
    /// cache.
    pub fn resolve_key(dotted: &str, dir: &Path) -> ModuleKey {
        let (base, rest) = match split_relative(dotted) {
            Some((dots, rest)) => {
                let mut base = dir.to_path_buf();
                for _ in 1..dots {
                    if !base.pop() {
                        return ModuleKey::Bad(dotted.to_string());
                    }
                }
                (base, rest)
            }
            None => (dir.to_path_buf(), dotted),
        };
        let segments: Vec<&str> = rest.split('.').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            // `from . import name` targets the package itself.
            let init = base.join("__init__.py");
            return if init.is_file() {
                ModuleKey::File(init)
            } else {
                ModuleKey::Bad(dotted.to_string())
            };
        }
        let mut current = base;
        for (i, segment) in segments.iter().enumerate() {
            let last = i == segments.len() - 1;
            if last {
                for ext in ["py", "pyi"] {
                    let file = current.join(format!("{segment}.{ext}"));
                    if file.is_file() {
                        return ModuleKey::File(file);
                    }
                }
            }
            let package = current.join(segment);
            let init = package.join("__init__.py");
            if init.is_file() {
                if last {
                    return ModuleKey::File(init);
                }
                current = package;
                continue;
            }
            break;
        }
        if !dotted.starts_with('.') && is_native_module(segments[0]) {
            ModuleKey::Native(dotted.to_string())
        } else {
            ModuleKey::Bad(dotted.to_string())
        }
    }

    /// Load the module for `key`, interpreting its source on a cache
    /// miss. A load already underway yields an unknown instead of
    /// recursing forever.
    pub fn load_by_key(&self, key: &ModuleKey) -> Value {
        if let Some(v) = self.registry.borrow().inner.cache.get(key) {
            return v.clone();
        }
        if self.registry.borrow().inner.in_progress.contains(key) {
            debug!(?key, "import cycle, yielding unknown");
            return Value::unknown("cyclic import");
        }
        self.registry
            .borrow_mut()
            .inner
            .in_progress
            .insert(key.clone());
        let value = match key {
            ModuleKey::File(path) => self.load_file(key, path),
            ModuleKey::Native(_) => Value::module(key.clone(), HashMap::new()),
            ModuleKey::Bad(name) => Value::unknown(format!("unresolved module {name}")),
        };
        let mut registry = self.registry.borrow_mut();
        registry.inner.in_progress.remove(key);
        registry.inner.cache.insert(key.clone(), value.clone());
        value
    }

    fn load_file(&self, key: &ModuleKey, path: &Path) -> Value {
        let source = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot read module source");
                return Value::unknown(format!("unreadable module {}", path.display()));
            }
        };
        let nodes = match crate::builder::build_module(&source) {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot parse module");
                return Value::unknown(format!("unparseable module {}", path.display()));
            }
        };
        let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
        let mut frame = Frame::module_frame(self.builtins(), self.clone(), dir);
        for node in &nodes {
            node.process(&mut frame);
        }
        Value::module(key.clone(), frame.locals_snapshot())
    }

    /// `import a.b.c`: load every prefix, link each module into its
    /// parent's members, return the leaf.
    pub fn import_module(&self, dotted: &str, dir: &Path) -> Value {
        if dotted.starts_with('.') {
            return self.load_by_key(&Self::resolve_key(dotted, dir));
        }
        let mut prefix = String::new();
        let mut parent: Option<Value> = None;
        let mut leaf = Value::unknown(dotted);
        for segment in dotted.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            let value = self.load_by_key(&Self::resolve_key(&prefix, dir));
            if let Some(parent) = &parent {
                parent.set_attribute(segment, value.clone());
            }
            parent = Some(value.clone());
            leaf = value;
        }
        leaf
    }

    /// `import a.b.c` without an alias binds the root package name.
    pub fn import_root(&self, dotted: &str, dir: &Path) -> (String, Value) {
        let root_name = dotted.split('.').next().unwrap_or(dotted).to_string();
        self.import_module(dotted, dir);
        let root = self.load_by_key(&Self::resolve_key(&root_name, dir));
        (root_name, root)
    }

    /// `from path import name`: a member of the module, or the
    /// submodule `path.name` when no member matches.
    pub fn from_import(&self, dotted: &str, name: &str, dir: &Path) -> Value {
        let base = self.import_module(dotted, dir);
        if base.has_attribute(name) == FuzzyBool::True {
            return base.get_attribute(name);
        }
        let sub = if dotted.ends_with('.') {
            format!("{dotted}{name}")
        } else {
            format!("{dotted}.{name}")
        };
        let key = Self::resolve_key(&sub, dir);
        if !key.is_bad() {
            return self.load_by_key(&key);
        }
        base.get_attribute(name)
    }

    /// Drop a cached module, forcing reinterpretation on the next load.
    /// Used when the file behind a key changes on disk mid-session.
    pub fn invalidate(&self, key: &ModuleKey) {
        self.registry.borrow_mut().inner.cache.remove(key);
    }

    /// Star-import bindings: public members of the target module.
    pub fn wildcard_exports(&self, dotted: &str, dir: &Path) -> Vec<(String, Value)> {
        let base = self.import_module(dotted, dir);
        module_public_members(&base)
    }

    /// Public module-scope bindings of a loaded module, for export
    /// harvesting.
    pub fn module_exports(&self, key: &ModuleKey) -> Vec<(String, Value)> {
        module_public_members(&self.load_by_key(key))
    }
}

fn split_relative(dotted: &str) -> Option<(usize, &str)> {
    if !dotted.starts_with('.') {
        return None;
    }
    let dots = dotted.chars().take_while(|c| *c == '.').count();
    Some((dots, &dotted[dots..]))
}

fn module_public_members(value: &Value) -> Vec<(String, Value)> {
    match value.kind() {
        ValueKind::Concrete(Concrete::Module(m)) => m
            .members
            .borrow()
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .map(|(name, v)| (name.clone(), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}
