use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::error::{AnalysisError, Result};
use crate::resolver::ModuleLoader;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Module,
    Function,
    Class,
}

/// One scope of abstract execution. Name resolution walks locals, then
/// globals, then builtins; child frames snapshot the caller's visible
/// bindings rather than holding a live reference to it.
pub struct Frame {
    kind: FrameKind,
    locals: HashMap<String, Value>,
    globals: HashMap<String, Value>,
    builtins: Rc<HashMap<String, Value>>,
    returns: Vec<Value>,
    loader: ModuleLoader,
    /// Directory of the source file, for resolving its imports.
    dir: PathBuf,
    /// Function bodies currently being interpreted anywhere on this
    /// frame chain, keyed by body address. Breaks recursive calls.
    active_calls: Rc<RefCell<HashSet<usize>>>,
}

impl Frame {
    pub fn module_frame(
        builtins: Rc<HashMap<String, Value>>,
        loader: ModuleLoader,
        dir: impl Into<PathBuf>,
    ) -> Frame {
        Frame {
            kind: FrameKind::Module,
            locals: HashMap::new(),
            globals: HashMap::new(),
            builtins,
            returns: Vec::new(),
            loader,
            dir: dir.into(),
            active_calls: Rc::new(RefCell::new(HashSet::new())),
        }
    }

    /// Standalone frame over a fresh loader with an empty directory.
    /// Enough for exercising statement processing in tests.
    pub fn for_tests() -> Frame {
        let loader = ModuleLoader::new();
        Frame::module_frame(loader.builtins(), loader, PathBuf::new())
    }

    /// Child frame for a function body or class body. The caller's
    /// globals and locals are folded into the child's globals, plus any
    /// closure bindings captured at definition time.
    pub fn make_child(&self, kind: FrameKind, closure: &HashMap<String, Value>) -> Frame {
        let mut globals = self.globals.clone();
        globals.extend(self.locals.iter().map(|(k, v)| (k.clone(), v.clone())));
        globals.extend(closure.iter().map(|(k, v)| (k.clone(), v.clone())));
        Frame {
            kind,
            locals: HashMap::new(),
            globals,
            builtins: Rc::clone(&self.builtins),
            returns: Vec::new(),
            loader: self.loader.clone(),
            dir: self.dir.clone(),
            active_calls: Rc::clone(&self.active_calls),
        }
    }

    /// Mark a function body as entered. Returns false when the body is
    /// already active further up the call chain.
    pub fn enter_call(&self, body: usize) -> bool {
        self.active_calls.borrow_mut().insert(body)
    }

    pub fn exit_call(&self, body: usize) {
        self.active_calls.borrow_mut().remove(&body);
    }

    pub fn loader(&self) -> ModuleLoader {
        self.loader.clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn get_assignment(&self, name: &str) -> Result<Value> {
        if let Some(v) = self.locals.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.globals.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.builtins.get(name) {
            return Ok(v.clone());
        }
        Err(AnalysisError::UndefinedName(name.to_string()))
    }

    /// Lenient lookup for interpretation: missing names degrade to an
    /// unknown instead of aborting the walk.
    pub fn lookup_or_unknown(&self, name: &str) -> Value {
        match self.get_assignment(name) {
            Ok(v) => v,
            Err(_) => {
                debug!(name, "undefined name during interpretation");
                Value::unknown(name)
            }
        }
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.locals.contains_key(name)
            || self.globals.contains_key(name)
            || self.builtins.contains_key(name)
    }

    pub fn set_local(&mut self, name: &str, value: Value) {
        self.locals.insert(name.to_string(), value);
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.locals.get(name).cloned()
    }

    /// Bindings introduced in this frame, in no particular order. Used
    /// to harvest class members and module exports.
    pub fn locals_snapshot(&self) -> HashMap<String, Value> {
        self.locals.clone()
    }

    pub fn local_names(&self) -> Vec<String> {
        self.locals.keys().cloned().collect()
    }

    pub fn add_return(&mut self, value: Value) {
        self.returns.push(value);
    }

    pub fn take_returns(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.returns)
    }

    pub fn builtins(&self) -> Rc<HashMap<String, Value>> {
        Rc::clone(&self.builtins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FuzzyBool;

    fn frame_with_builtin(name: &str) -> Frame {
        Frame::module_frame(
            Rc::new(HashMap::from([(name.to_string(), Value::native(name))])),
            ModuleLoader::new(),
            PathBuf::new(),
        )
    }

    #[test]
    fn test_lookup_order_locals_globals_builtins() {
        let mut frame = frame_with_builtin("len");
        assert!(frame.get_assignment("len").is_ok());
        frame.set_local("len", Value::int(1));
        let v = frame.get_assignment("len").unwrap();
        assert_eq!(v.value_equals(&Value::int(1)), FuzzyBool::True);
    }

    #[test]
    fn test_undefined_name_errors() {
        let frame = Frame::for_tests();
        match frame.get_assignment("ghost") {
            Err(AnalysisError::UndefinedName(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected undefined name, got {other:?}"),
        }
        assert!(frame.lookup_or_unknown("ghost").is_unknown());
    }

    #[test]
    fn test_child_snapshots_caller_bindings() {
        let mut parent = Frame::for_tests();
        parent.set_local("x", Value::int(1));
        let child = parent.make_child(FrameKind::Function, &HashMap::new());
        assert!(child.get_assignment("x").is_ok());

        // Later rebinding in the parent is invisible to the snapshot.
        parent.set_local("x", Value::int(2));
        let v = child.get_assignment("x").unwrap();
        assert_eq!(v.value_equals(&Value::int(1)), FuzzyBool::True);
    }

    #[test]
    fn test_child_locals_do_not_leak_upward() {
        let parent = Frame::for_tests();
        let mut child = parent.make_child(FrameKind::Function, &HashMap::new());
        child.set_local("y", Value::int(3));
        assert!(parent.get_assignment("y").is_err());
    }
}
