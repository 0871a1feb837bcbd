use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::cfg::CfgNode;
use crate::error::{AnalysisError, Result};
use crate::frame::{Frame, FrameKind};
use crate::resolver::ModuleKey;

/// Three-valued truth for abstract interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzyBool {
    True,
    False,
    Maybe,
}

impl FuzzyBool {
    pub fn invert(self) -> FuzzyBool {
        match self {
            FuzzyBool::True => FuzzyBool::False,
            FuzzyBool::False => FuzzyBool::True,
            FuzzyBool::Maybe => FuzzyBool::Maybe,
        }
    }

    pub fn from_bool(b: bool) -> FuzzyBool {
        if b {
            FuzzyBool::True
        } else {
            FuzzyBool::False
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

/// Parameter of a function value with its default already evaluated at
/// definition time.
#[derive(Debug, Clone)]
pub struct BoundParameter {
    pub name: String,
    pub kind: ParameterKind,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Single,
    VarPositional,
    VarKeyword,
}

#[derive(Debug, Clone)]
pub struct FunctionObj {
    pub name: String,
    pub params: Vec<BoundParameter>,
    pub body: Rc<Vec<CfgNode>>,
    /// Caller-visible bindings captured when the def was processed.
    pub closure: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: String,
    pub members: Rc<RefCell<HashMap<String, Value>>>,
}

#[derive(Debug, Clone)]
pub struct ModuleObj {
    pub key: ModuleKey,
    pub members: Rc<RefCell<HashMap<String, Value>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    List,
    Tuple,
    Set,
}

#[derive(Debug, Clone)]
pub enum Concrete {
    Literal(Literal),
    Function(FunctionObj),
    Class(ClassObj),
    /// Instance of the referenced class value.
    Instance(Value),
    Module(ModuleObj),
    Collection(CollectionKind, Vec<Value>),
    Dict(Vec<(Value, Value)>),
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    Concrete(Concrete),
    /// Builtin or extension object known only by name.
    Native(String),
    /// Result the interpreter could not determine, labeled by origin.
    Unknown(String),
    /// One of several possible values.
    Fuzzy(Vec<Value>),
}

#[derive(Debug)]
struct ValueCell {
    kind: ValueKind,
    /// Dynamically assigned attributes, shared across clones.
    attrs: HashMap<String, Value>,
}

/// A shared, mutable abstract value. Cloning is cheap and aliases the
/// same cell, so attribute writes through one handle are visible through
/// all others, matching Python object identity.
#[derive(Clone)]
pub struct Value {
    cell: Rc<RefCell<ValueCell>>,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:?})", self.cell.borrow().kind)
    }
}

impl Value {
    fn from_kind(kind: ValueKind) -> Value {
        Value {
            cell: Rc::new(RefCell::new(ValueCell {
                kind,
                attrs: HashMap::new(),
            })),
        }
    }

    pub fn unknown(origin: impl Into<String>) -> Value {
        Value::from_kind(ValueKind::Unknown(origin.into()))
    }

    pub fn native(name: impl Into<String>) -> Value {
        Value::from_kind(ValueKind::Native(name.into()))
    }

    pub fn none() -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Literal(Literal::None)))
    }

    pub fn int(v: i64) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Literal(Literal::Int(v))))
    }

    pub fn float(v: f64) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Literal(Literal::Float(v))))
    }

    pub fn str(v: impl Into<String>) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Literal(Literal::Str(
            v.into(),
        ))))
    }

    pub fn bool(v: bool) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Literal(Literal::Bool(v))))
    }

    pub fn literal(lit: Literal) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Literal(lit)))
    }

    pub fn function(f: FunctionObj) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Function(f)))
    }

    pub fn class(name: impl Into<String>, members: HashMap<String, Value>) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Class(ClassObj {
            name: name.into(),
            members: Rc::new(RefCell::new(members)),
        })))
    }

    pub fn module(key: ModuleKey, members: HashMap<String, Value>) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Module(ModuleObj {
            key,
            members: Rc::new(RefCell::new(members)),
        })))
    }

    pub fn collection(kind: CollectionKind, items: Vec<Value>) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Collection(kind, items)))
    }

    pub fn dict(pairs: Vec<(Value, Value)>) -> Value {
        Value::from_kind(ValueKind::Concrete(Concrete::Dict(pairs)))
    }

    /// Combine possible values, flattening one fuzzy level. A single
    /// survivor collapses to itself; zero becomes an unknown.
    pub fn fuzzy(values: Vec<Value>) -> Value {
        let mut flat = Vec::new();
        for v in values {
            let fuzzy_members = match &v.cell.borrow().kind {
                ValueKind::Fuzzy(members) => Some(members.clone()),
                _ => None,
            };
            match fuzzy_members {
                Some(members) => flat.extend(members),
                None => flat.push(v),
            }
        }
        match flat.len() {
            0 => Value::unknown("empty fuzzy"),
            1 => flat.into_iter().next().unwrap_or_else(Value::none),
            _ => Value::from_kind(ValueKind::Fuzzy(flat)),
        }
    }

    /// Whether two handles alias the same underlying cell.
    pub fn same_cell(a: &Value, b: &Value) -> bool {
        Rc::ptr_eq(&a.cell, &b.cell)
    }

    pub fn kind(&self) -> ValueKind {
        self.cell.borrow().kind.clone()
    }

    pub fn is_fuzzy(&self) -> bool {
        matches!(self.cell.borrow().kind, ValueKind::Fuzzy(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.cell.borrow().kind, ValueKind::Unknown(_))
    }

    /// The single possible value, or an ambiguity error when several
    /// remain.
    pub fn single(&self) -> Result<Value> {
        match &self.cell.borrow().kind {
            ValueKind::Fuzzy(members) if members.len() == 1 => Ok(members[0].clone()),
            ValueKind::Fuzzy(members) => Err(AnalysisError::AmbiguousValue(format!(
                "{} possible values",
                members.len()
            ))),
            _ => Ok(self.clone()),
        }
    }

    pub fn has_attribute(&self, name: &str) -> FuzzyBool {
        let cell = self.cell.borrow();
        if cell.attrs.contains_key(name) {
            return FuzzyBool::True;
        }
        match &cell.kind {
            ValueKind::Concrete(Concrete::Class(c)) => {
                FuzzyBool::from_bool(c.members.borrow().contains_key(name))
            }
            ValueKind::Concrete(Concrete::Module(m)) => {
                FuzzyBool::from_bool(m.members.borrow().contains_key(name))
            }
            ValueKind::Concrete(Concrete::Instance(class)) => {
                match class.has_attribute(name) {
                    FuzzyBool::False => FuzzyBool::Maybe,
                    other => other,
                }
            }
            ValueKind::Concrete(_) => FuzzyBool::Maybe,
            ValueKind::Native(_) | ValueKind::Unknown(_) => FuzzyBool::Maybe,
            ValueKind::Fuzzy(members) => {
                let mut results = members.iter().map(|m| m.has_attribute(name));
                match results.next() {
                    None => FuzzyBool::Maybe,
                    Some(first) => {
                        if results.all(|r| r == first) {
                            first
                        } else {
                            FuzzyBool::Maybe
                        }
                    }
                }
            }
        }
    }

    /// Attribute access never fails outright: an unresolvable attribute
    /// degrades to an unknown labeled with its access path.
    pub fn get_attribute(&self, name: &str) -> Value {
        let cell = self.cell.borrow();
        if let Some(v) = cell.attrs.get(name) {
            return v.clone();
        }
        match &cell.kind {
            ValueKind::Concrete(Concrete::Class(c)) => c
                .members
                .borrow()
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::unknown(format!("{}.{}", c.name, name))),
            ValueKind::Concrete(Concrete::Module(m)) => m
                .members
                .borrow()
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::unknown(format!("{}.{}", m.key.basename(), name))),
            ValueKind::Concrete(Concrete::Instance(class)) => class.get_attribute(name),
            ValueKind::Native(n) => Value::unknown(format!("{n}.{name}")),
            ValueKind::Unknown(origin) => Value::unknown(format!("{origin}.{name}")),
            ValueKind::Fuzzy(members) => {
                Value::fuzzy(members.iter().map(|m| m.get_attribute(name)).collect())
            }
            ValueKind::Concrete(_) => Value::unknown(format!("<value>.{name}")),
        }
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let kind = self.cell.borrow().kind.clone();
        match kind {
            ValueKind::Concrete(Concrete::Class(c)) => {
                c.members.borrow_mut().insert(name, value);
            }
            ValueKind::Concrete(Concrete::Module(m)) => {
                m.members.borrow_mut().insert(name, value);
            }
            ValueKind::Fuzzy(members) => {
                for m in &members {
                    m.set_attribute(name.clone(), value.clone());
                }
            }
            _ => {
                self.cell.borrow_mut().attrs.insert(name, value);
            }
        }
    }

    pub fn bool_value(&self) -> FuzzyBool {
        match &self.cell.borrow().kind {
            ValueKind::Concrete(Concrete::Literal(lit)) => match lit {
                Literal::Bool(b) => FuzzyBool::from_bool(*b),
                Literal::Int(i) => FuzzyBool::from_bool(*i != 0),
                Literal::Float(f) => FuzzyBool::from_bool(*f != 0.0),
                Literal::Str(s) => FuzzyBool::from_bool(!s.is_empty()),
                Literal::None => FuzzyBool::False,
            },
            ValueKind::Concrete(Concrete::Collection(_, items)) => {
                FuzzyBool::from_bool(!items.is_empty())
            }
            ValueKind::Concrete(Concrete::Dict(pairs)) => FuzzyBool::from_bool(!pairs.is_empty()),
            ValueKind::Fuzzy(members) => {
                let mut results = members.iter().map(|m| m.bool_value());
                match results.next() {
                    None => FuzzyBool::Maybe,
                    Some(first) => {
                        if results.all(|r| r == first) {
                            first
                        } else {
                            FuzzyBool::Maybe
                        }
                    }
                }
            }
            _ => FuzzyBool::Maybe,
        }
    }

    pub fn value_equals(&self, other: &Value) -> FuzzyBool {
        if Rc::ptr_eq(&self.cell, &other.cell) {
            return FuzzyBool::True;
        }
        let a = self.cell.borrow();
        let b = other.cell.borrow();
        match (&a.kind, &b.kind) {
            (
                ValueKind::Concrete(Concrete::Literal(la)),
                ValueKind::Concrete(Concrete::Literal(lb)),
            ) => FuzzyBool::from_bool(la == lb),
            (ValueKind::Fuzzy(members), _) => {
                let mut any_true = false;
                let mut any_nonfalse = false;
                for m in members {
                    match m.value_equals(other) {
                        FuzzyBool::True => any_true = true,
                        FuzzyBool::Maybe => any_nonfalse = true,
                        FuzzyBool::False => {}
                    }
                }
                if any_true && members.len() == 1 {
                    FuzzyBool::True
                } else if any_true || any_nonfalse {
                    FuzzyBool::Maybe
                } else {
                    FuzzyBool::False
                }
            }
            (_, ValueKind::Fuzzy(_)) => other.value_equals(self),
            _ => FuzzyBool::Maybe,
        }
    }

    /// Abstractly call this value. Functions interpret their body in a
    /// child frame; classes construct an instance and run `__init__`;
    /// fuzzy callees broadcast over their members.
    pub fn call(&self, args: Vec<Value>, kwargs: Vec<(String, Value)>, frame: &Frame) -> Value {
        let kind = self.cell.borrow().kind.clone();
        match kind {
            ValueKind::Concrete(Concrete::Function(f)) => f.invoke(args, kwargs, frame),
            ValueKind::Concrete(Concrete::Class(c)) => {
                let instance =
                    Value::from_kind(ValueKind::Concrete(Concrete::Instance(self.clone())));
                if let Some(init) = c.members.borrow().get("__init__").cloned() {
                    let mut init_args = vec![instance.clone()];
                    init_args.extend(args);
                    init.call(init_args, kwargs, frame);
                }
                instance
            }
            ValueKind::Fuzzy(members) => {
                Value::fuzzy(
                    members
                        .iter()
                        .map(|m| m.call(args.clone(), kwargs.clone(), frame))
                        .collect(),
                )
            }
            ValueKind::Native(name) => Value::unknown(format!("{name}(...)")),
            ValueKind::Unknown(origin) => Value::unknown(format!("{origin}(...)")),
            _ => {
                debug!("calling a non-callable value");
                Value::unknown("non-callable")
            }
        }
    }

    pub fn get_item(&self, key: &Value) -> Value {
        let kind = self.cell.borrow().kind.clone();
        match kind {
            ValueKind::Concrete(Concrete::Collection(_, items)) => {
                if let ValueKind::Concrete(Concrete::Literal(Literal::Int(i))) = key.kind() {
                    let idx = if i < 0 { items.len() as i64 + i } else { i };
                    if idx >= 0 && (idx as usize) < items.len() {
                        return items[idx as usize].clone();
                    }
                }
                Value::fuzzy(items)
            }
            ValueKind::Concrete(Concrete::Dict(pairs)) => {
                let mut candidates = Vec::new();
                for (k, v) in &pairs {
                    match k.value_equals(key) {
                        FuzzyBool::True => return v.clone(),
                        FuzzyBool::Maybe => candidates.push(v.clone()),
                        FuzzyBool::False => {}
                    }
                }
                Value::fuzzy(candidates)
            }
            ValueKind::Fuzzy(members) => {
                Value::fuzzy(members.iter().map(|m| m.get_item(key)).collect())
            }
            _ => Value::unknown("subscript"),
        }
    }

    /// Store under a subscript. Collections and dicts are updated in
    /// place through the shared cell; anything else degrades silently.
    pub fn set_item(&self, key: &Value, value: Value) {
        let kind = self.cell.borrow().kind.clone();
        match kind {
            ValueKind::Concrete(Concrete::Collection(collection, mut items)) => {
                if let ValueKind::Concrete(Concrete::Literal(Literal::Int(i))) = key.kind() {
                    let idx = if i < 0 { items.len() as i64 + i } else { i };
                    if idx >= 0 && (idx as usize) < items.len() {
                        items[idx as usize] = value;
                        self.cell.borrow_mut().kind =
                            ValueKind::Concrete(Concrete::Collection(collection, items));
                    }
                }
            }
            ValueKind::Concrete(Concrete::Dict(mut pairs)) => {
                match pairs.iter_mut().find(|(k, _)| k.value_equals(key) == FuzzyBool::True) {
                    Some((_, slot)) => *slot = value,
                    None => pairs.push((key.clone(), value)),
                }
                self.cell.borrow_mut().kind = ValueKind::Concrete(Concrete::Dict(pairs));
            }
            ValueKind::Fuzzy(members) => {
                for member in &members {
                    member.set_item(key, value.clone());
                }
            }
            _ => debug!("subscript store on an opaque value"),
        }
    }

    /// Possible element values when iterated over.
    pub fn iterated_item(&self) -> Value {
        let kind = self.cell.borrow().kind.clone();
        match kind {
            ValueKind::Concrete(Concrete::Collection(_, items)) => Value::fuzzy(items),
            ValueKind::Concrete(Concrete::Dict(pairs)) => {
                Value::fuzzy(pairs.into_iter().map(|(k, _)| k).collect())
            }
            ValueKind::Fuzzy(members) => {
                Value::fuzzy(members.iter().map(|m| m.iterated_item()).collect())
            }
            _ => Value::unknown("iteration"),
        }
    }
}

impl FunctionObj {
    fn invoke(&self, args: Vec<Value>, kwargs: Vec<(String, Value)>, frame: &Frame) -> Value {
        let body_id = Rc::as_ptr(&self.body) as *const () as usize;
        if !frame.enter_call(body_id) {
            debug!(name = self.name, "re-entrant call, result unknown");
            return Value::unknown(self.name.as_str());
        }
        let mut child = frame.make_child(FrameKind::Function, &self.closure);
        let mut args = args.into_iter();
        let mut kwargs: HashMap<String, Value> = kwargs.into_iter().collect();
        for param in &self.params {
            match param.kind {
                ParameterKind::Single => {
                    let bound = args
                        .next()
                        .or_else(|| kwargs.remove(&param.name))
                        .or_else(|| param.default.clone())
                        .unwrap_or_else(|| Value::unknown(format!("param {}", param.name)));
                    child.set_local(&param.name, bound);
                }
                ParameterKind::VarPositional => {
                    let rest: Vec<Value> = args.by_ref().collect();
                    child.set_local(&param.name, Value::collection(CollectionKind::Tuple, rest));
                }
                ParameterKind::VarKeyword => {
                    let pairs = kwargs
                        .drain()
                        .map(|(k, v)| (Value::str(k), v))
                        .collect();
                    child.set_local(&param.name, Value::dict(pairs));
                }
            }
        }
        for node in self.body.iter() {
            node.process(&mut child);
        }
        frame.exit_call(body_id);
        let returns = child.take_returns();
        match returns.len() {
            0 => Value::none(),
            1 => returns.into_iter().next().unwrap_or_else(Value::none),
            _ => Value::fuzzy(returns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuzzy_bool_invert() {
        assert_eq!(FuzzyBool::True.invert(), FuzzyBool::False);
        assert_eq!(FuzzyBool::False.invert(), FuzzyBool::True);
        assert_eq!(FuzzyBool::Maybe.invert(), FuzzyBool::Maybe);
    }

    #[test]
    fn test_fuzzy_flattens_one_level() {
        let inner = Value::fuzzy(vec![Value::int(1), Value::int(2)]);
        let outer = Value::fuzzy(vec![inner, Value::int(3)]);
        match outer.kind() {
            ValueKind::Fuzzy(members) => assert_eq!(members.len(), 3),
            other => panic!("expected fuzzy, got {other:?}"),
        }
    }

    #[test]
    fn test_fuzzy_single_member_collapses() {
        let v = Value::fuzzy(vec![Value::int(7)]);
        assert!(!v.is_fuzzy());
        assert_eq!(v.value_equals(&Value::int(7)), FuzzyBool::True);
    }

    #[test]
    fn test_empty_fuzzy_is_unknown() {
        assert!(Value::fuzzy(vec![]).is_unknown());
    }

    #[test]
    fn test_single_on_ambiguous_errors() {
        let v = Value::fuzzy(vec![Value::int(1), Value::int(2)]);
        match v.single() {
            Err(AnalysisError::AmbiguousValue(_)) => {}
            other => panic!("expected ambiguity, got {other:?}"),
        }
        assert!(Value::int(1).single().is_ok());
    }

    #[test]
    fn test_bool_value_of_literals() {
        assert_eq!(Value::int(0).bool_value(), FuzzyBool::False);
        assert_eq!(Value::int(3).bool_value(), FuzzyBool::True);
        assert_eq!(Value::str("").bool_value(), FuzzyBool::False);
        assert_eq!(Value::none().bool_value(), FuzzyBool::False);
        assert_eq!(Value::unknown("x").bool_value(), FuzzyBool::Maybe);
    }

    #[test]
    fn test_fuzzy_bool_value_agreement() {
        let agree = Value::fuzzy(vec![Value::int(1), Value::bool(true)]);
        assert_eq!(agree.bool_value(), FuzzyBool::True);
        let disagree = Value::fuzzy(vec![Value::int(0), Value::bool(true)]);
        assert_eq!(disagree.bool_value(), FuzzyBool::Maybe);
    }

    #[test]
    fn test_attribute_bag_shared_across_clones() {
        let v = Value::unknown("obj");
        let alias = v.clone();
        v.set_attribute("field", Value::int(5));
        assert_eq!(
            alias.get_attribute("field").value_equals(&Value::int(5)),
            FuzzyBool::True
        );
    }

    #[test]
    fn test_unknown_attribute_access_degrades() {
        let v = Value::unknown("mystery");
        let attr = v.get_attribute("missing");
        assert!(attr.is_unknown());
        assert_eq!(v.has_attribute("missing"), FuzzyBool::Maybe);
    }

    #[test]
    fn test_fuzzy_attribute_broadcast() {
        let a = Value::class("A", HashMap::from([("x".to_string(), Value::int(1))]));
        let b = Value::class("B", HashMap::from([("x".to_string(), Value::int(2))]));
        let either = Value::fuzzy(vec![a, b]);
        let attr = either.get_attribute("x");
        assert!(attr.is_fuzzy());
        assert_eq!(attr.bool_value(), FuzzyBool::True);
    }

    #[test]
    fn test_instance_falls_back_to_class_members() {
        let class = Value::class("C", HashMap::from([("m".to_string(), Value::int(9))]));
        let instance = Value::from_kind(ValueKind::Concrete(Concrete::Instance(class)));
        assert_eq!(
            instance.get_attribute("m").value_equals(&Value::int(9)),
            FuzzyBool::True
        );
        instance.set_attribute("own", Value::int(1));
        assert_eq!(
            instance.get_attribute("own").value_equals(&Value::int(1)),
            FuzzyBool::True
        );
    }

    #[test]
    fn test_get_item_concrete_index() {
        let list = Value::collection(
            CollectionKind::List,
            vec![Value::int(10), Value::int(20), Value::int(30)],
        );
        assert_eq!(
            list.get_item(&Value::int(1)).value_equals(&Value::int(20)),
            FuzzyBool::True
        );
        assert_eq!(
            list.get_item(&Value::int(-1)).value_equals(&Value::int(30)),
            FuzzyBool::True
        );
        // Unresolvable index widens to all elements.
        assert!(list.get_item(&Value::unknown("i")).is_fuzzy());
    }

    #[test]
    fn test_dict_get_item() {
        let d = Value::dict(vec![
            (Value::str("a"), Value::int(1)),
            (Value::str("b"), Value::int(2)),
        ]);
        assert_eq!(
            d.get_item(&Value::str("b")).value_equals(&Value::int(2)),
            FuzzyBool::True
        );
    }

    #[test]
    fn test_set_item_updates_in_place() {
        let list = Value::collection(CollectionKind::List, vec![Value::int(1), Value::int(2)]);
        let alias = list.clone();
        list.set_item(&Value::int(0), Value::int(9));
        assert_eq!(
            alias.get_item(&Value::int(0)).value_equals(&Value::int(9)),
            FuzzyBool::True
        );

        let d = Value::dict(vec![(Value::str("a"), Value::int(1))]);
        d.set_item(&Value::str("b"), Value::int(2));
        assert_eq!(
            d.get_item(&Value::str("b")).value_equals(&Value::int(2)),
            FuzzyBool::True
        );
    }
}
