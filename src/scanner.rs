use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;

use crate::builder::build_module;
use crate::cfg::CfgNode;
use crate::expr::{merge_usages, SymbolUsages};
use crate::resolver::{builtin_names, ModuleLoader};

/// Find names read in `source` that no binding in the file, no builtin,
/// and no wildcard import provides. Each result carries how the name is
/// used, for ranking fix candidates.
pub fn scan_missing_symbols(source: &str, dir: &Path) -> Result<SymbolUsages> {
    scan_missing_symbols_with(&ModuleLoader::new(), source, dir)
}

/// Like [`scan_missing_symbols`], reusing a caller's loader so module
/// interpretation done for wildcard imports is shared across files.
pub fn scan_missing_symbols_with(
    loader: &ModuleLoader,
    source: &str,
    dir: &Path,
) -> Result<SymbolUsages> {
    let nodes = build_module(source)?;
    let mut free = scope_free(&nodes, loader, dir);
    let builtins: HashSet<&str> = builtin_names().iter().copied().collect();
    free.retain(|name, _| !builtins.contains(name.as_str()));
    Ok(free)
}

/// Free names of one scope: everything its statements read, plus what
/// leaks out of nested scopes, minus the names the scope binds anywhere.
/// Binding anywhere in the scope shadows, matching Python's whole-scope
/// name resolution.
fn scope_free(body: &[CfgNode], loader: &ModuleLoader, dir: &Path) -> SymbolUsages {
    let mut bound = HashSet::new();
    for node in body {
        node.bound_names(&mut bound);
    }
    collect_wildcard_bindings(body, loader, dir, &mut bound);
    let mut free = SymbolUsages::new();
    for node in body {
        collect_usages(node, loader, dir, &mut free);
    }
    for name in &bound {
        free.remove(name);
    }
    free
}

/// Names a `from m import *` in this scope would bind.
fn collect_wildcard_bindings(
    body: &[CfgNode],
    loader: &ModuleLoader,
    dir: &Path,
    out: &mut HashSet<String>,
) {
    fn walk(body: &[CfgNode], loader: &ModuleLoader, dir: &Path, out: &mut HashSet<String>) {
        for node in body {
            match node {
                CfgNode::FromImport { path, names }
                    if names.iter().any(|n| n.name == "*") =>
                {
                    for (name, _) in loader.wildcard_exports(path, dir) {
                        out.insert(name);
                    }
                }
                CfgNode::If { branches } => {
                    for (_, b) in branches {
                        walk(b, loader, dir, out);
                    }
                }
                CfgNode::While {
                    body, else_body, ..
                }
                | CfgNode::For {
                    body, else_body, ..
                } => {
                    walk(body, loader, dir, out);
                    walk(else_body, loader, dir, out);
                }
                CfgNode::Try {
                    body,
                    handlers,
                    else_body,
                    finally,
                } => {
                    walk(body, loader, dir, out);
                    for (_, h) in handlers {
                        walk(h, loader, dir, out);
                    }
                    walk(else_body, loader, dir, out);
                    walk(finally, loader, dir, out);
                }
                CfgNode::With { body, .. } => walk(body, loader, dir, out),
                CfgNode::Group(body) => walk(body, loader, dir, out),
                _ => {}
            }
        }
    }
    walk(body, loader, dir, out);
}

fn collect_usages(node: &CfgNode, loader: &ModuleLoader, dir: &Path, out: &mut SymbolUsages) {
    use crate::cfg::AssignTarget;

    fn target_usages(target: &AssignTarget, out: &mut SymbolUsages) {
        match target {
            AssignTarget::Attribute(base, _) => merge_usages(out, base.free_symbols()),
            AssignTarget::Subscript(base, index) => {
                merge_usages(out, base.free_symbols());
                merge_usages(out, index.free_symbols());
            }
            AssignTarget::Tuple(elements) => {
                for e in elements {
                    target_usages(e, out);
                }
            }
            AssignTarget::Starred(inner) => target_usages(inner, out),
            AssignTarget::Name(_) => {}
        }
    }

    let body_usages = |bodies: &[&[CfgNode]], out: &mut SymbolUsages| {
        for body in bodies {
            for node in *body {
                collect_usages(node, loader, dir, out);
            }
        }
    };

    match node {
        CfgNode::Expression(expr) => merge_usages(out, expr.free_symbols()),
        CfgNode::Assign { targets, value, .. } => {
            merge_usages(out, value.free_symbols());
            for target in targets {
                target_usages(target, out);
            }
        }
        CfgNode::Return { value } => {
            if let Some(value) = value {
                merge_usages(out, value.free_symbols());
            }
        }
        CfgNode::Import { .. } | CfgNode::FromImport { .. } | CfgNode::NoOp => {}
        CfgNode::If { branches } => {
            for (condition, body) in branches {
                merge_usages(out, condition.free_symbols());
                body_usages(&[body], out);
            }
        }
        CfgNode::While {
            condition,
            body,
            else_body,
        } => {
            merge_usages(out, condition.free_symbols());
            body_usages(&[body, else_body], out);
        }
        CfgNode::For {
            targets,
            iterable,
            body,
            else_body,
        } => {
            merge_usages(out, iterable.free_symbols());
            for target in targets {
                target_usages(target, out);
            }
            body_usages(&[body, else_body], out);
        }
        CfgNode::Try {
            body,
            handlers,
            else_body,
            finally,
        } => {
            body_usages(&[body, else_body, finally], out);
            for (_, handler) in handlers {
                body_usages(&[handler], out);
            }
        }
        CfgNode::With { items, body } => {
            for (expr, _) in items {
                merge_usages(out, expr.free_symbols());
            }
            body_usages(&[body], out);
        }
        CfgNode::FunctionDef { params, body, .. } => {
            // Defaults are evaluated in the enclosing scope.
            let mut inner = scope_free(body, loader, dir);
            for param in params {
                if let Some(default) = &param.default {
                    merge_usages(out, default.free_symbols());
                }
                inner.remove(&param.name);
            }
            merge_usages(out, inner);
        }
        CfgNode::ClassDef { bases, body, .. } => {
            for base in bases {
                merge_usages(out, base.free_symbols());
            }
            merge_usages(out, scope_free(body, loader, dir));
        }
        CfgNode::Group(body) => body_usages(&[body], out),
    }
}
