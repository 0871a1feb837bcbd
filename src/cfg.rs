use std::collections::HashSet;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::frame::{Frame, FrameKind};
use crate::value::{BoundParameter, FunctionObj, FuzzyBool, ParameterKind, Value};

/// Left-hand side of an assignment or loop target.
#[derive(Debug, Clone)]
pub enum AssignTarget {
    Name(String),
    Attribute(Expr, String),
    Subscript(Expr, Expr),
    Tuple(Vec<AssignTarget>),
    Starred(Box<AssignTarget>),
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct ImportedName {
    pub name: String,
    pub alias: Option<String>,
}

/// One import site, flattened for index bookkeeping. `name` is set for
/// `from` imports, `None` for whole-module imports. Persisted in the
/// per-file import snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportRef {
    pub path: String,
    pub name: Option<String>,
    pub alias: Option<String>,
}

/// A statement of the control flow graph. Bodies are plain vectors:
/// abstract interpretation walks them in order, visiting loop bodies
/// once and merging divergent branches.
#[derive(Debug, Clone)]
pub enum CfgNode {
    Expression(Expr),
    Assign {
        targets: Vec<AssignTarget>,
        /// Operator of an augmented assignment (`+=` etc.), if any.
        op: Option<String>,
        value: Expr,
    },
    Return {
        value: Option<Expr>,
    },
    Import {
        path: String,
        alias: Option<String>,
    },
    FromImport {
        path: String,
        /// A name of `*` imports every export.
        names: Vec<ImportedName>,
    },
    /// Condition/body pairs; an `else` arm carries a constant-true
    /// condition.
    If {
        branches: Vec<(Expr, Vec<CfgNode>)>,
    },
    While {
        condition: Expr,
        body: Vec<CfgNode>,
        else_body: Vec<CfgNode>,
    },
    For {
        targets: Vec<AssignTarget>,
        iterable: Expr,
        body: Vec<CfgNode>,
        else_body: Vec<CfgNode>,
    },
    Try {
        body: Vec<CfgNode>,
        /// Bound exception name (if any) and handler body.
        handlers: Vec<(Option<String>, Vec<CfgNode>)>,
        else_body: Vec<CfgNode>,
        finally: Vec<CfgNode>,
    },
    With {
        items: Vec<(Expr, Option<AssignTarget>)>,
        body: Vec<CfgNode>,
    },
    FunctionDef {
        name: String,
        params: Vec<Parameter>,
        body: Rc<Vec<CfgNode>>,
    },
    ClassDef {
        name: String,
        bases: Vec<Expr>,
        body: Vec<CfgNode>,
    },
    Group(Vec<CfgNode>),
    NoOp,
}

fn process_body(frame: &mut Frame, body: &[CfgNode]) {
    for node in body {
        node.process(frame);
    }
}

/// Process a body whose execution is not certain. Bindings that diverge
/// from the pre-state are merged into fuzzy values rather than
/// overwritten.
fn process_divergent(frame: &mut Frame, body: &[CfgNode]) {
    let before = frame.locals_snapshot();
    process_body(frame, body);
    let after = frame.locals_snapshot();
    for (name, val) in after {
        match before.get(&name) {
            Some(prev) if Value::same_cell(prev, &val) => {}
            Some(prev) => frame.set_local(&name, Value::fuzzy(vec![prev.clone(), val])),
            None => frame.set_local(&name, val),
        }
    }
}

fn assign_target(frame: &mut Frame, target: &AssignTarget, value: Value) {
    match target {
        AssignTarget::Name(name) => frame.set_local(name, value),
        AssignTarget::Attribute(base, attr) => {
            base.evaluate(frame).set_attribute(attr.clone(), value);
        }
        AssignTarget::Subscript(base, index) => {
            let container = base.evaluate(frame);
            let key = index.evaluate(frame);
            container.set_item(&key, value);
        }
        AssignTarget::Tuple(elements) => {
            let item = value.iterated_item();
            for element in elements {
                assign_target(frame, element, item.clone());
            }
        }
        AssignTarget::Starred(inner) => assign_target(frame, inner, value),
    }
}

impl CfgNode {
    pub fn process(&self, frame: &mut Frame) {
        match self {
            CfgNode::Expression(expr) => {
                expr.evaluate(frame);
            }
            CfgNode::Assign { targets, op, value } => {
                let rhs = value.evaluate(frame);
                let bound = if op.is_some() {
                    // Augmented assignment widens to unknown; the prior
                    // binding guarantees the name exists either way.
                    Value::unknown("augmented assignment")
                } else {
                    rhs
                };
                for target in targets {
                    assign_target(frame, target, bound.clone());
                }
            }
            CfgNode::Return { value } => {
                let v = match value {
                    Some(expr) => expr.evaluate(frame),
                    None => Value::none(),
                };
                frame.add_return(v);
            }
            CfgNode::Import { path, alias } => {
                let loader = frame.loader();
                match alias {
                    Some(alias) => {
                        let module = loader.import_module(path, frame.dir());
                        frame.set_local(alias, module);
                    }
                    None => {
                        let (root_name, root) = loader.import_root(path, frame.dir());
                        frame.set_local(&root_name, root);
                    }
                }
            }
            CfgNode::FromImport { path, names } => {
                let loader = frame.loader();
                for imported in names {
                    if imported.name == "*" {
                        for (name, value) in loader.wildcard_exports(path, frame.dir()) {
                            frame.set_local(&name, value);
                        }
                    } else {
                        let value = loader.from_import(path, &imported.name, frame.dir());
                        let binding = imported.alias.as_ref().unwrap_or(&imported.name);
                        frame.set_local(binding, value);
                    }
                }
            }
            CfgNode::If { branches } => {
                let mut ambiguous = false;
                for (condition, body) in branches {
                    match condition.evaluate(frame).bool_value() {
                        FuzzyBool::False => continue,
                        FuzzyBool::True if !ambiguous => {
                            process_body(frame, body);
                            break;
                        }
                        FuzzyBool::True => {
                            process_divergent(frame, body);
                            break;
                        }
                        FuzzyBool::Maybe => {
                            process_divergent(frame, body);
                            ambiguous = true;
                        }
                    }
                }
            }
            CfgNode::While {
                condition,
                body,
                else_body,
            } => {
                condition.evaluate(frame);
                process_divergent(frame, body);
                process_divergent(frame, else_body);
            }
            CfgNode::For {
                targets,
                iterable,
                body,
                else_body,
            } => {
                let item = iterable.evaluate(frame).iterated_item();
                for target in targets {
                    assign_target(frame, target, item.clone());
                }
                process_divergent(frame, body);
                process_divergent(frame, else_body);
            }
            CfgNode::Try {
                body,
                handlers,
                else_body,
                finally,
            } => {
                process_divergent(frame, body);
                for (name, handler) in handlers {
                    if let Some(name) = name {
                        frame.set_local(name, Value::unknown("caught exception"));
                    }
                    process_divergent(frame, handler);
                }
                process_divergent(frame, else_body);
                process_body(frame, finally);
            }
            CfgNode::With { items, body } => {
                for (expr, target) in items {
                    let value = expr.evaluate(frame);
                    if let Some(target) = target {
                        assign_target(frame, target, value);
                    }
                }
                process_body(frame, body);
            }
            CfgNode::FunctionDef { name, params, body } => {
                let params = params
                    .iter()
                    .map(|p| BoundParameter {
                        name: p.name.clone(),
                        kind: p.kind,
                        default: p.default.as_ref().map(|d| d.evaluate(frame)),
                    })
                    .collect();
                let function = Value::function(FunctionObj {
                    name: name.clone(),
                    params,
                    body: Rc::clone(body),
                    closure: frame.locals_snapshot(),
                });
                frame.set_local(name, function);
            }
            CfgNode::ClassDef { name, bases, body } => {
                let mut members = std::collections::HashMap::new();
                for base in bases {
                    let base = base.evaluate(frame);
                    if let crate::value::ValueKind::Concrete(crate::value::Concrete::Class(c)) =
                        base.kind()
                    {
                        for (k, v) in c.members.borrow().iter() {
                            members.insert(k.clone(), v.clone());
                        }
                    }
                }
                let mut class_frame = frame.make_child(FrameKind::Class, &Default::default());
                process_body(&mut class_frame, body);
                members.extend(class_frame.locals_snapshot());
                frame.set_local(name, Value::class(name.clone(), members));
            }
            CfgNode::Group(body) => process_body(frame, body),
            CfgNode::NoOp => {}
        }
    }

    /// Names this statement binds in its enclosing scope. Nested
    /// function and class bodies are their own scopes and do not
    /// contribute.
    pub fn bound_names(&self, out: &mut HashSet<String>) {
        fn target_names(target: &AssignTarget, out: &mut HashSet<String>) {
            match target {
                AssignTarget::Name(name) => {
                    out.insert(name.clone());
                }
                AssignTarget::Tuple(elements) => {
                    for e in elements {
                        target_names(e, out);
                    }
                }
                AssignTarget::Starred(inner) => target_names(inner, out),
                AssignTarget::Attribute(..) | AssignTarget::Subscript(..) => {}
            }
        }
        fn body_names(body: &[CfgNode], out: &mut HashSet<String>) {
            for node in body {
                node.bound_names(out);
            }
        }
        match self {
            CfgNode::Assign { targets, .. } | CfgNode::For { targets, .. } => {
                for t in targets {
                    target_names(t, out);
                }
                if let CfgNode::For {
                    body, else_body, ..
                } = self
                {
                    body_names(body, out);
                    body_names(else_body, out);
                }
            }
            CfgNode::Import { path, alias } => {
                let bound = match alias {
                    Some(alias) => alias.clone(),
                    None => path.split('.').next().unwrap_or(path).to_string(),
                };
                out.insert(bound);
            }
            CfgNode::FromImport { names, .. } => {
                for imported in names {
                    if imported.name != "*" {
                        out.insert(
                            imported
                                .alias
                                .clone()
                                .unwrap_or_else(|| imported.name.clone()),
                        );
                    }
                }
            }
            CfgNode::If { branches } => {
                for (_, body) in branches {
                    body_names(body, out);
                }
            }
            CfgNode::While {
                body, else_body, ..
            } => {
                body_names(body, out);
                body_names(else_body, out);
            }
            CfgNode::Try {
                body,
                handlers,
                else_body,
                finally,
            } => {
                body_names(body, out);
                for (name, handler) in handlers {
                    if let Some(name) = name {
                        out.insert(name.clone());
                    }
                    body_names(handler, out);
                }
                body_names(else_body, out);
                body_names(finally, out);
            }
            CfgNode::With { items, body } => {
                for (_, target) in items {
                    if let Some(target) = target {
                        target_names(target, out);
                    }
                }
                body_names(body, out);
            }
            CfgNode::FunctionDef { name, .. } | CfgNode::ClassDef { name, .. } => {
                out.insert(name.clone());
            }
            CfgNode::Group(body) => body_names(body, out),
            CfgNode::Expression(_) | CfgNode::Return { .. } | CfgNode::NoOp => {}
        }
    }

    /// Every import site in this statement, recursing into all nested
    /// bodies.
    pub fn collect_imports(&self, out: &mut Vec<ImportRef>) {
        fn walk(body: &[CfgNode], out: &mut Vec<ImportRef>) {
            for node in body {
                node.collect_imports(out);
            }
        }
        match self {
            CfgNode::Import { path, alias } => out.push(ImportRef {
                path: path.clone(),
                name: None,
                alias: alias.clone(),
            }),
            CfgNode::FromImport { path, names } => {
                for imported in names {
                    out.push(ImportRef {
                        path: path.clone(),
                        name: Some(imported.name.clone()),
                        alias: imported.alias.clone(),
                    });
                }
            }
            CfgNode::If { branches } => {
                for (_, body) in branches {
                    walk(body, out);
                }
            }
            CfgNode::While {
                body, else_body, ..
            }
            | CfgNode::For {
                body, else_body, ..
            } => {
                walk(body, out);
                walk(else_body, out);
            }
            CfgNode::Try {
                body,
                handlers,
                else_body,
                finally,
            } => {
                walk(body, out);
                for (_, handler) in handlers {
                    walk(handler, out);
                }
                walk(else_body, out);
                walk(finally, out);
            }
            CfgNode::With { body, .. } => walk(body, out),
            CfgNode::FunctionDef { body, .. } => walk(body, out),
            CfgNode::ClassDef { body, .. } => walk(body, out),
            CfgNode::Group(body) => walk(body, out),
            CfgNode::Expression(_)
            | CfgNode::Assign { .. }
            | CfgNode::Return { .. }
            | CfgNode::NoOp => {}
        }
    }
}
