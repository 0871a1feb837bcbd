use std::collections::HashMap;
use std::rc::Rc;

use crate::cfg::CfgNode;
use crate::frame::{Frame, FrameKind};
use crate::value::{
    BoundParameter, CollectionKind, FunctionObj, FuzzyBool, Literal, ParameterKind, Value,
};

/// How a name is used at a reference site. Drives ranking of import-fix
/// candidates: a call site wants a callable, an attribute access wants a
/// module or object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageContext {
    Raw,
    Call { args: usize, kwargs: Vec<String> },
    Subscript,
    Attribute(String),
    Multiple(Vec<UsageContext>),
}

impl UsageContext {
    /// Merge two usages of the same name. A bare mention adds nothing
    /// once a more specific usage is known.
    pub fn merge(self, other: UsageContext) -> UsageContext {
        let mut flat = Vec::new();
        for ctx in [self, other] {
            match ctx {
                UsageContext::Multiple(inner) => flat.extend(inner),
                single => flat.push(single),
            }
        }
        if flat.iter().any(|c| *c != UsageContext::Raw) {
            flat.retain(|c| *c != UsageContext::Raw);
        }
        let mut deduped: Vec<UsageContext> = Vec::new();
        for ctx in flat {
            if !deduped.contains(&ctx) {
                deduped.push(ctx);
            }
        }
        if deduped.len() == 1 {
            deduped.into_iter().next().unwrap_or(UsageContext::Raw)
        } else {
            UsageContext::Multiple(deduped)
        }
    }

    /// Short human-readable rendering for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            UsageContext::Raw => "referenced".to_string(),
            UsageContext::Call { args, kwargs } => {
                if kwargs.is_empty() {
                    format!("called with {args} argument(s)")
                } else {
                    format!(
                        "called with {} argument(s) and keyword(s) {}",
                        args,
                        kwargs.join(", ")
                    )
                }
            }
            UsageContext::Subscript => "subscripted".to_string(),
            UsageContext::Attribute(attr) => format!("attribute .{attr} accessed"),
            UsageContext::Multiple(inner) => {
                let parts: Vec<String> = inner.iter().map(UsageContext::describe).collect();
                parts.join("; ")
            }
        }
    }
}

pub type SymbolUsages = HashMap<String, UsageContext>;

fn add_usage(map: &mut SymbolUsages, name: &str, ctx: UsageContext) {
    match map.remove(name) {
        Some(existing) => {
            map.insert(name.to_string(), existing.merge(ctx));
        }
        None => {
            map.insert(name.to_string(), ctx);
        }
    }
}

pub fn merge_usages(into: &mut SymbolUsages, from: SymbolUsages) {
    for (name, ctx) in from {
        add_usage(into, &name, ctx);
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Variable(String),
    Attribute(Box<Expr>, String),
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Binary {
        left: Box<Expr>,
        op: String,
        right: Box<Expr>,
    },
    Unary {
        op: String,
        operand: Box<Expr>,
    },
    /// Chained comparison; only the operands matter for analysis.
    Compare {
        op: String,
        operands: Vec<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    ListLit(Vec<Expr>),
    TupleLit(Vec<Expr>),
    SetLit(Vec<Expr>),
    /// Key of `None` marks a `**splat` entry.
    DictLit(Vec<(Option<Expr>, Expr)>),
    Comprehension {
        element: Box<Expr>,
        bound: Vec<String>,
        /// Iterated expressions, evaluated in the enclosing scope.
        sources: Vec<Expr>,
        /// `if` clause filters, evaluated with the bound names in scope.
        conditions: Vec<Expr>,
    },
    Starred(Box<Expr>),
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    /// Syntax the builder does not model, kept as its source text.
    Unknown(String),
}

/// A value that is definitely a bool but could be either one.
fn maybe_bool() -> Value {
    Value::fuzzy(vec![Value::bool(true), Value::bool(false)])
}

fn from_fuzzy_bool(b: FuzzyBool) -> Value {
    match b {
        FuzzyBool::True => Value::bool(true),
        FuzzyBool::False => Value::bool(false),
        FuzzyBool::Maybe => maybe_bool(),
    }
}

impl Expr {
    /// Abstractly evaluate against `frame`. Never fails: anything the
    /// interpreter cannot determine becomes an unknown.
    pub fn evaluate(&self, frame: &Frame) -> Value {
        match self {
            Expr::Literal(lit) => Value::literal(lit.clone()),
            Expr::Variable(name) => frame.lookup_or_unknown(name),
            Expr::Attribute(base, attr) => base.evaluate(frame).get_attribute(attr),
            Expr::Subscript { value, index } => {
                value.evaluate(frame).get_item(&index.evaluate(frame))
            }
            Expr::Call {
                callee,
                args,
                kwargs,
            } => {
                let callee = callee.evaluate(frame);
                let args = args.iter().map(|a| a.evaluate(frame)).collect();
                let kwargs = kwargs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.evaluate(frame)))
                    .collect();
                callee.call(args, kwargs, frame)
            }
            Expr::Binary { left, op, right } => {
                evaluate_binary(&left.evaluate(frame), op, right, frame)
            }
            Expr::Unary { op, operand } => {
                let v = operand.evaluate(frame);
                match op.as_str() {
                    "not" => from_fuzzy_bool(v.bool_value().invert()),
                    _ => Value::unknown(format!("unary {op}")),
                }
            }
            Expr::Compare { op, operands } => {
                let values: Vec<Value> = operands.iter().map(|o| o.evaluate(frame)).collect();
                if values.len() == 2 {
                    match op.as_str() {
                        "==" => return from_fuzzy_bool(values[0].value_equals(&values[1])),
                        "!=" => {
                            return from_fuzzy_bool(values[0].value_equals(&values[1]).invert())
                        }
                        _ => {}
                    }
                }
                maybe_bool()
            }
            Expr::Conditional {
                condition,
                if_true,
                if_false,
            } => match condition.evaluate(frame).bool_value() {
                FuzzyBool::True => if_true.evaluate(frame),
                FuzzyBool::False => if_false.evaluate(frame),
                FuzzyBool::Maybe => {
                    Value::fuzzy(vec![if_true.evaluate(frame), if_false.evaluate(frame)])
                }
            },
            Expr::ListLit(items) => Value::collection(
                CollectionKind::List,
                items.iter().map(|i| i.evaluate(frame)).collect(),
            ),
            Expr::TupleLit(items) => Value::collection(
                CollectionKind::Tuple,
                items.iter().map(|i| i.evaluate(frame)).collect(),
            ),
            Expr::SetLit(items) => Value::collection(
                CollectionKind::Set,
                items.iter().map(|i| i.evaluate(frame)).collect(),
            ),
            Expr::DictLit(pairs) => Value::dict(
                pairs
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Some(expr) => expr.evaluate(frame),
                            None => Value::unknown("splat key"),
                        };
                        (key, v.evaluate(frame))
                    })
                    .collect(),
            ),
            Expr::Comprehension {
                element,
                bound,
                sources,
                conditions,
            } => {
                let mut closure = HashMap::new();
                let items: Vec<Value> =
                    sources.iter().map(|s| s.evaluate(frame).iterated_item()).collect();
                let item = Value::fuzzy(items);
                for name in bound {
                    closure.insert(name.clone(), item.clone());
                }
                let scope = frame.make_child(FrameKind::Function, &closure);
                for condition in conditions {
                    condition.evaluate(&scope);
                }
                Value::collection(CollectionKind::List, vec![element.evaluate(&scope)])
            }
            Expr::Starred(inner) => inner.evaluate(frame),
            Expr::Lambda { params, body } => Value::function(FunctionObj {
                name: "<lambda>".to_string(),
                params: params
                    .iter()
                    .map(|p| BoundParameter {
                        name: p.clone(),
                        kind: ParameterKind::Single,
                        default: None,
                    })
                    .collect(),
                body: Rc::new(vec![CfgNode::Return {
                    value: Some((**body).clone()),
                }]),
                closure: frame.locals_snapshot(),
            }),
            Expr::Unknown(text) => Value::unknown(text.clone()),
        }
    }

    /// Names this expression reads, each with how it is used. Names
    /// bound inside the expression (comprehension targets, lambda
    /// parameters) are excluded.
    pub fn free_symbols(&self) -> SymbolUsages {
        let mut out = SymbolUsages::new();
        self.collect_free_symbols(&mut out);
        out
    }

    fn collect_free_symbols(&self, out: &mut SymbolUsages) {
        match self {
            Expr::Literal(_) | Expr::Unknown(_) => {}
            Expr::Variable(name) => add_usage(out, name, UsageContext::Raw),
            Expr::Attribute(base, attr) => match base.as_ref() {
                Expr::Variable(name) => {
                    add_usage(out, name, UsageContext::Attribute(attr.clone()))
                }
                other => other.collect_free_symbols(out),
            },
            Expr::Subscript { value, index } => {
                match value.as_ref() {
                    Expr::Variable(name) => add_usage(out, name, UsageContext::Subscript),
                    other => other.collect_free_symbols(out),
                }
                index.collect_free_symbols(out);
            }
            Expr::Call {
                callee,
                args,
                kwargs,
            } => {
                match callee.as_ref() {
                    Expr::Variable(name) => add_usage(
                        out,
                        name,
                        UsageContext::Call {
                            args: args.len(),
                            kwargs: kwargs.iter().map(|(k, _)| k.clone()).collect(),
                        },
                    ),
                    other => other.collect_free_symbols(out),
                }
                for arg in args {
                    arg.collect_free_symbols(out);
                }
                for (_, v) in kwargs {
                    v.collect_free_symbols(out);
                }
            }
            Expr::Binary { left, right, .. } => {
                left.collect_free_symbols(out);
                right.collect_free_symbols(out);
            }
            Expr::Unary { operand, .. } => operand.collect_free_symbols(out),
            Expr::Compare { operands, .. } => {
                for op in operands {
                    op.collect_free_symbols(out);
                }
            }
            Expr::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                condition.collect_free_symbols(out);
                if_true.collect_free_symbols(out);
                if_false.collect_free_symbols(out);
            }
            Expr::ListLit(items) | Expr::TupleLit(items) | Expr::SetLit(items) => {
                for item in items {
                    item.collect_free_symbols(out);
                }
            }
            Expr::DictLit(pairs) => {
                for (k, v) in pairs {
                    if let Some(k) = k {
                        k.collect_free_symbols(out);
                    }
                    v.collect_free_symbols(out);
                }
            }
            Expr::Comprehension {
                element,
                bound,
                sources,
                conditions,
            } => {
                let mut inner = element.free_symbols();
                for condition in conditions {
                    merge_usages(&mut inner, condition.free_symbols());
                }
                for name in bound {
                    inner.remove(name);
                }
                merge_usages(out, inner);
                for source in sources {
                    source.collect_free_symbols(out);
                }
            }
            Expr::Starred(inner) => inner.collect_free_symbols(out),
            Expr::Lambda { params, body } => {
                let mut inner = body.free_symbols();
                for param in params {
                    inner.remove(param);
                }
                merge_usages(out, inner);
            }
        }
    }
}

fn evaluate_binary(left: &Value, op: &str, right_expr: &Expr, frame: &Frame) -> Value {
    // Short-circuit operators keep operand values, as in Python.
    match op {
        "and" => {
            return match left.bool_value() {
                FuzzyBool::False => left.clone(),
                FuzzyBool::True => right_expr.evaluate(frame),
                FuzzyBool::Maybe => Value::fuzzy(vec![left.clone(), right_expr.evaluate(frame)]),
            }
        }
        "or" => {
            return match left.bool_value() {
                FuzzyBool::True => left.clone(),
                FuzzyBool::False => right_expr.evaluate(frame),
                FuzzyBool::Maybe => Value::fuzzy(vec![left.clone(), right_expr.evaluate(frame)]),
            }
        }
        _ => {}
    }
    let right = right_expr.evaluate(frame);
    if let (Ok(a), Ok(b)) = (left.single(), right.single()) {
        use crate::value::{Concrete, ValueKind};
        if let (
            ValueKind::Concrete(Concrete::Literal(la)),
            ValueKind::Concrete(Concrete::Literal(lb)),
        ) = (a.kind(), b.kind())
        {
            match (la, op, lb) {
                (Literal::Int(x), "+", Literal::Int(y)) => return Value::int(x + y),
                (Literal::Int(x), "-", Literal::Int(y)) => return Value::int(x - y),
                (Literal::Int(x), "*", Literal::Int(y)) => return Value::int(x * y),
                (Literal::Str(x), "+", Literal::Str(y)) => {
                    return Value::str(format!("{x}{y}"))
                }
                _ => {}
            }
        }
    }
    Value::unknown(format!("binary {op}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_frame() -> Frame {
        Frame::for_tests()
    }

    fn var(name: &str) -> Expr {
        Expr::Variable(name.to_string())
    }

    #[test]
    fn test_variable_reads_frame() {
        let mut frame = empty_frame();
        frame.set_local("x", Value::int(4));
        let v = var("x").evaluate(&frame);
        assert_eq!(v.value_equals(&Value::int(4)), FuzzyBool::True);
        assert!(var("missing").evaluate(&frame).is_unknown());
    }

    #[test]
    fn test_integer_arithmetic_folds() {
        let frame = empty_frame();
        let sum = Expr::Binary {
            left: Box::new(Expr::Literal(Literal::Int(2))),
            op: "+".to_string(),
            right: Box::new(Expr::Literal(Literal::Int(3))),
        };
        assert_eq!(
            sum.evaluate(&frame).value_equals(&Value::int(5)),
            FuzzyBool::True
        );
    }

    #[test]
    fn test_not_inverts() {
        let frame = empty_frame();
        let e = Expr::Unary {
            op: "not".to_string(),
            operand: Box::new(Expr::Literal(Literal::Bool(false))),
        };
        assert_eq!(e.evaluate(&frame).bool_value(), FuzzyBool::True);
    }

    #[test]
    fn test_ambiguous_conditional_is_fuzzy() {
        let frame = empty_frame();
        let e = Expr::Conditional {
            condition: Box::new(var("unknown_flag")),
            if_true: Box::new(Expr::Literal(Literal::Int(1))),
            if_false: Box::new(Expr::Literal(Literal::Int(2))),
        };
        assert!(e.evaluate(&frame).is_fuzzy());
    }

    #[test]
    fn test_free_symbols_attribute_context() {
        let e = Expr::Attribute(Box::new(var("os")), "path".to_string());
        let syms = e.free_symbols();
        assert_eq!(syms.get("os"), Some(&UsageContext::Attribute("path".into())));
    }

    #[test]
    fn test_free_symbols_call_context() {
        let e = Expr::Call {
            callee: Box::new(var("f")),
            args: vec![var("a")],
            kwargs: vec![("key".to_string(), var("b"))],
        };
        let syms = e.free_symbols();
        assert_eq!(
            syms.get("f"),
            Some(&UsageContext::Call {
                args: 1,
                kwargs: vec!["key".to_string()],
            })
        );
        assert_eq!(syms.get("a"), Some(&UsageContext::Raw));
        assert_eq!(syms.get("b"), Some(&UsageContext::Raw));
    }

    #[test]
    fn test_usage_merge_drops_raw() {
        let merged = UsageContext::Raw.merge(UsageContext::Subscript);
        assert_eq!(merged, UsageContext::Subscript);
        let multi = UsageContext::Subscript.merge(UsageContext::Attribute("x".into()));
        assert_eq!(
            multi,
            UsageContext::Multiple(vec![
                UsageContext::Subscript,
                UsageContext::Attribute("x".into()),
            ])
        );
    }

    #[test]
    fn test_comprehension_binds_targets() {
        let e = Expr::Comprehension {
            element: Box::new(Expr::Binary {
                left: Box::new(var("item")),
                op: "+".to_string(),
                right: Box::new(var("offset")),
            }),
            bound: vec!["item".to_string()],
            sources: vec![var("values")],
            conditions: vec![],
        };
        let syms = e.free_symbols();
        assert!(!syms.contains_key("item"));
        assert!(syms.contains_key("offset"));
        assert!(syms.contains_key("values"));
    }

    #[test]
    fn test_comprehension_condition_sees_bound_names() {
        let e = Expr::Comprehension {
            element: Box::new(var("item")),
            bound: vec!["item".to_string()],
            sources: vec![var("values")],
            conditions: vec![Expr::Binary {
                left: Box::new(var("item")),
                op: ">".to_string(),
                right: Box::new(var("threshold")),
            }],
        };
        let syms = e.free_symbols();
        assert!(!syms.contains_key("item"));
        assert!(syms.contains_key("threshold"));
        assert!(syms.contains_key("values"));
    }

    #[test]
    fn test_lambda_evaluates_to_callable() {
        let frame = empty_frame();
        let lam = Expr::Lambda {
            params: vec!["x".to_string()],
            body: Box::new(var("x")),
        };
        let f = lam.evaluate(&frame);
        let result = f.call(vec![Value::int(9)], vec![], &frame);
        assert_eq!(result.value_equals(&Value::int(9)), FuzzyBool::True);
    }
}
