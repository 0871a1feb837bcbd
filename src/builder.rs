use anyhow::{Context, Result};
use std::rc::Rc;

use tracing::debug;
use tree_sitter::{Node, Parser};

use crate::cfg::{AssignTarget, CfgNode, ImportedName, Parameter};
use crate::expr::Expr;
use crate::value::{Literal, ParameterKind};

/// Parse Python source into a list of top-level CFG statements.
pub fn build_module(source: &str) -> Result<Vec<CfgNode>> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .context("failed to set parser language")?;
    let tree = parser
        .parse(source, None)
        .context("tree-sitter failed to parse")?;
    let builder = CfgBuilder { source };
    Ok(builder.build_block(tree.root_node()))
}

/// Lowers the tree-sitter CST into CFG statements and expressions.
/// Anything the grammar produces that the analysis does not model
/// degrades to a no-op or an unknown expression instead of failing.
struct CfgBuilder<'a> {
    source: &'a str,
}

impl<'a> CfgBuilder<'a> {
    fn node_text(&self, node: Node) -> &str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    fn build_block(&self, node: Node) -> Vec<CfgNode> {
        let mut cursor = node.walk();
        node.named_children(&mut cursor)
            .filter(|child| child.kind() != "comment")
            .map(|child| self.statement(child))
            .collect()
    }

    fn statement(&self, node: Node) -> CfgNode {
        match node.kind() {
            "expression_statement" => {
                let Some(inner) = node.named_child(0) else {
                    return CfgNode::NoOp;
                };
                match inner.kind() {
                    "assignment" => self.assignment(inner, None),
                    "augmented_assignment" => {
                        let op = inner
                            .child_by_field_name("operator")
                            .map(|n| self.node_text(n).to_string())
                            .unwrap_or_else(|| "+=".to_string());
                        self.assignment(inner, Some(op))
                    }
                    _ => CfgNode::Expression(self.expression(inner)),
                }
            }
            "if_statement" => self.if_statement(node),
            "while_statement" => CfgNode::While {
                condition: self.field_expr(node, "condition"),
                body: self.field_block(node, "body"),
                else_body: self.else_clause_block(node),
            },
            "for_statement" => CfgNode::For {
                targets: node
                    .child_by_field_name("left")
                    .map(|n| vec![self.target(n)])
                    .unwrap_or_default(),
                iterable: self.field_expr(node, "right"),
                body: self.field_block(node, "body"),
                else_body: self.else_clause_block(node),
            },
            "try_statement" => self.try_statement(node),
            "with_statement" => self.with_statement(node),
            "function_definition" => self.function_definition(node),
            "class_definition" => self.class_definition(node),
            "decorated_definition" => {
                let mut nodes = Vec::new();
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    if child.kind() == "decorator" {
                        if let Some(expr) = child.named_child(0) {
                            nodes.push(CfgNode::Expression(self.expression(expr)));
                        }
                    }
                }
                if let Some(definition) = node.child_by_field_name("definition") {
                    nodes.push(self.statement(definition));
                }
                CfgNode::Group(nodes)
            }
            "return_statement" => CfgNode::Return {
                value: node.named_child(0).map(|n| self.expression(n)),
            },
            "import_statement" => self.import_statement(node),
            "import_from_statement" => self.import_from_statement(node),
            "raise_statement" | "assert_statement" | "delete_statement"
            | "print_statement" => {
                let mut cursor = node.walk();
                CfgNode::Group(
                    node.named_children(&mut cursor)
                        .map(|child| CfgNode::Expression(self.expression(child)))
                        .collect(),
                )
            }
            "pass_statement" | "break_statement" | "continue_statement"
            | "global_statement" | "nonlocal_statement" | "comment"
            | "future_import_statement" => CfgNode::NoOp,
            "block" => CfgNode::Group(self.build_block(node)),
            other => {
                debug!(kind = other, "unmodeled statement kind");
                CfgNode::NoOp
            }
        }
    }

    fn assignment(&self, node: Node, op: Option<String>) -> CfgNode {
        let targets = node
            .child_by_field_name("left")
            .map(|n| vec![self.target(n)])
            .unwrap_or_default();
        let value = node
            .child_by_field_name("right")
            .map(|n| self.expression(n))
            // Bare annotation (`x: int`) still introduces the name.
            .unwrap_or(Expr::Unknown("annotation".to_string()));
        CfgNode::Assign { targets, op, value }
    }

    fn if_statement(&self, node: Node) -> CfgNode {
        let mut branches = vec![(
            self.field_expr(node, "condition"),
            self.field_block(node, "consequence"),
        )];
        let mut cursor = node.walk();
        for alt in node.children_by_field_name("alternative", &mut cursor) {
            match alt.kind() {
                "elif_clause" => branches.push((
                    self.field_expr(alt, "condition"),
                    self.field_block(alt, "consequence"),
                )),
                "else_clause" => branches.push((
                    Expr::Literal(Literal::Bool(true)),
                    self.field_block(alt, "body"),
                )),
                _ => {}
            }
        }
        CfgNode::If { branches }
    }

    fn try_statement(&self, node: Node) -> CfgNode {
        let body = self.field_block(node, "body");
        let mut handlers = Vec::new();
        let mut else_body = Vec::new();
        let mut finally = Vec::new();
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "except_clause" | "except_group_clause" => {
                    // `except E as name:` binds name; a bare except binds
                    // nothing.
                    let name = child
                        .named_children(&mut child.walk())
                        .find(|n| n.kind() == "as_pattern")
                        .and_then(|p| p.child_by_field_name("alias"))
                        .map(|alias| match alias.named_child(0) {
                            Some(inner) => self.node_text(inner).to_string(),
                            None => self.node_text(alias).to_string(),
                        });
                    let handler_body = child
                        .named_children(&mut child.walk())
                        .find(|n| n.kind() == "block")
                        .map(|n| self.build_block(n))
                        .unwrap_or_default();
                    handlers.push((name, handler_body));
                }
                "else_clause" => else_body = self.field_block(child, "body"),
                "finally_clause" => {
                    finally = child
                        .named_children(&mut child.walk())
                        .find(|n| n.kind() == "block")
                        .map(|n| self.build_block(n))
                        .unwrap_or_default();
                }
                _ => {}
            }
        }
        CfgNode::Try {
            body,
            handlers,
            else_body,
            finally,
        }
    }

    fn with_statement(&self, node: Node) -> CfgNode {
        let mut items = Vec::new();
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            if child.kind() != "with_clause" {
                continue;
            }
            let mut clause_cursor = child.walk();
            for item in child.named_children(&mut clause_cursor) {
                if item.kind() != "with_item" {
                    continue;
                }
                let Some(value) = item.child_by_field_name("value") else {
                    continue;
                };
                if value.kind() == "as_pattern" {
                    let expr = value
                        .named_child(0)
                        .map(|n| self.expression(n))
                        .unwrap_or(Expr::Unknown("with item".to_string()));
                    let target = value
                        .child_by_field_name("alias")
                        .and_then(|alias| alias.named_child(0).or(Some(alias)))
                        .map(|n| self.target(n));
                    items.push((expr, target));
                } else {
                    items.push((self.expression(value), None));
                }
            }
        }
        CfgNode::With {
            items,
            body: self.field_block(node, "body"),
        }
    }

    fn function_definition(&self, node: Node) -> CfgNode {
        CfgNode::FunctionDef {
            name: self.field_text(node, "name"),
            params: node
                .child_by_field_name("parameters")
                .map(|n| self.parameters(n))
                .unwrap_or_default(),
            body: Rc::new(self.field_block(node, "body")),
        }
    }

    fn class_definition(&self, node: Node) -> CfgNode {
        let bases = node
            .child_by_field_name("superclasses")
            .map(|args| {
                let mut cursor = args.walk();
                args.named_children(&mut cursor)
                    .filter(|n| n.kind() != "keyword_argument")
                    .map(|n| self.expression(n))
                    .collect()
            })
            .unwrap_or_default();
        CfgNode::ClassDef {
            name: self.field_text(node, "name"),
            bases,
            body: self.field_block(node, "body"),
        }
    }

    fn import_statement(&self, node: Node) -> CfgNode {
        let mut nodes = Vec::new();
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "dotted_name" => nodes.push(CfgNode::Import {
                    path: self.node_text(child).to_string(),
                    alias: None,
                }),
                "aliased_import" => nodes.push(CfgNode::Import {
                    path: self.field_text(child, "name"),
                    alias: Some(self.field_text(child, "alias")),
                }),
                _ => {}
            }
        }
        match nodes.len() {
            1 => nodes.remove(0),
            _ => CfgNode::Group(nodes),
        }
    }

    fn import_from_statement(&self, node: Node) -> CfgNode {
        let path = node
            .child_by_field_name("module_name")
            .map(|n| self.node_text(n).to_string())
            .unwrap_or_default();
        let mut names = Vec::new();
        let mut cursor = node.walk();
        for child in node.children_by_field_name("name", &mut cursor) {
            match child.kind() {
                "dotted_name" | "identifier" => names.push(ImportedName {
                    name: self.node_text(child).to_string(),
                    alias: None,
                }),
                "aliased_import" => names.push(ImportedName {
                    name: self.field_text(child, "name"),
                    alias: Some(self.field_text(child, "alias")),
                }),
                _ => {}
            }
        }
        let mut wildcard_cursor = node.walk();
        if names.is_empty()
            && node
                .named_children(&mut wildcard_cursor)
                .any(|n| n.kind() == "wildcard_import")
        {
            names.push(ImportedName {
                name: "*".to_string(),
                alias: None,
            });
        }
        CfgNode::FromImport { path, names }
    }

    fn parameters(&self, node: Node) -> Vec<Parameter> {
        let mut params = Vec::new();
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "identifier" => params.push(Parameter {
                    name: self.node_text(child).to_string(),
                    kind: ParameterKind::Single,
                    default: None,
                }),
                "typed_parameter" => {
                    if let Some(name) = child.named_child(0) {
                        params.push(Parameter {
                            name: self.node_text(name).to_string(),
                            kind: ParameterKind::Single,
                            default: None,
                        });
                    }
                }
                "default_parameter" | "typed_default_parameter" => params.push(Parameter {
                    name: self.field_text(child, "name"),
                    kind: ParameterKind::Single,
                    default: child
                        .child_by_field_name("value")
                        .map(|n| self.expression(n)),
                }),
                "list_splat_pattern" => params.push(Parameter {
                    name: child
                        .named_child(0)
                        .map(|n| self.node_text(n).to_string())
                        .unwrap_or_default(),
                    kind: ParameterKind::VarPositional,
                    default: None,
                }),
                "dictionary_splat_pattern" => params.push(Parameter {
                    name: child
                        .named_child(0)
                        .map(|n| self.node_text(n).to_string())
                        .unwrap_or_default(),
                    kind: ParameterKind::VarKeyword,
                    default: None,
                }),
                _ => {}
            }
        }
        params
    }

    fn target(&self, node: Node) -> AssignTarget {
        match node.kind() {
            "identifier" => AssignTarget::Name(self.node_text(node).to_string()),
            "attribute" => AssignTarget::Attribute(
                self.field_expr(node, "object"),
                self.field_text(node, "attribute"),
            ),
            "subscript" => AssignTarget::Subscript(
                self.field_expr(node, "value"),
                node.child_by_field_name("subscript")
                    .map(|n| self.expression(n))
                    .unwrap_or(Expr::Unknown("subscript".to_string())),
            ),
            "pattern_list" | "tuple_pattern" | "list_pattern" | "expression_list" | "tuple"
            | "list" => {
                let mut cursor = node.walk();
                AssignTarget::Tuple(
                    node.named_children(&mut cursor)
                        .map(|child| self.target(child))
                        .collect(),
                )
            }
            "list_splat_pattern" => AssignTarget::Starred(Box::new(
                node.named_child(0)
                    .map(|n| self.target(n))
                    .unwrap_or(AssignTarget::Tuple(Vec::new())),
            )),
            "parenthesized_expression" => node
                .named_child(0)
                .map(|n| self.target(n))
                .unwrap_or(AssignTarget::Tuple(Vec::new())),
            other => {
                debug!(kind = other, "unmodeled assignment target");
                AssignTarget::Tuple(Vec::new())
            }
        }
    }

    fn expression(&self, node: Node) -> Expr {
        match node.kind() {
            "identifier" => Expr::Variable(self.node_text(node).to_string()),
            "attribute" => Expr::Attribute(
                Box::new(self.field_expr(node, "object")),
                self.field_text(node, "attribute"),
            ),
            "subscript" => Expr::Subscript {
                value: Box::new(self.field_expr(node, "value")),
                index: Box::new(
                    node.child_by_field_name("subscript")
                        .map(|n| self.expression(n))
                        .unwrap_or(Expr::Unknown("subscript".to_string())),
                ),
            },
            "call" => self.call(node),
            "binary_operator" | "boolean_operator" => Expr::Binary {
                left: Box::new(self.field_expr(node, "left")),
                op: node
                    .child_by_field_name("operator")
                    .map(|n| self.node_text(n).to_string())
                    .unwrap_or_default(),
                right: Box::new(self.field_expr(node, "right")),
            },
            "not_operator" => Expr::Unary {
                op: "not".to_string(),
                operand: Box::new(self.field_expr(node, "argument")),
            },
            "unary_operator" => Expr::Unary {
                op: node
                    .child_by_field_name("operator")
                    .map(|n| self.node_text(n).to_string())
                    .unwrap_or_default(),
                operand: Box::new(self.field_expr(node, "argument")),
            },
            "comparison_operator" => {
                let mut cursor = node.walk();
                let operands = node
                    .named_children(&mut cursor)
                    .map(|n| self.expression(n))
                    .collect();
                // The operator tokens are unnamed children.
                let op = node
                    .child(1)
                    .map(|n| self.node_text(n).to_string())
                    .unwrap_or_default();
                Expr::Compare { op, operands }
            }
            "conditional_expression" => {
                let mut cursor = node.walk();
                let parts: Vec<Node> = node.named_children(&mut cursor).collect();
                if parts.len() == 3 {
                    Expr::Conditional {
                        if_true: Box::new(self.expression(parts[0])),
                        condition: Box::new(self.expression(parts[1])),
                        if_false: Box::new(self.expression(parts[2])),
                    }
                } else {
                    Expr::Unknown(self.node_text(node).to_string())
                }
            }
            "list" => Expr::ListLit(self.child_expressions(node)),
            "set" => Expr::SetLit(self.child_expressions(node)),
            "tuple" | "expression_list" | "pattern_list" => {
                Expr::TupleLit(self.child_expressions(node))
            }
            "dictionary" => {
                let mut pairs = Vec::new();
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    match child.kind() {
                        "pair" => pairs.push((
                            child.child_by_field_name("key").map(|n| self.expression(n)),
                            self.field_expr(child, "value"),
                        )),
                        "dictionary_splat" => {
                            if let Some(inner) = child.named_child(0) {
                                pairs.push((None, self.expression(inner)));
                            }
                        }
                        _ => {}
                    }
                }
                Expr::DictLit(pairs)
            }
            "list_comprehension" | "set_comprehension" | "generator_expression" => {
                self.comprehension(node, None)
            }
            "dictionary_comprehension" => {
                let pair = node.child_by_field_name("body");
                let element = pair.map(|p| {
                    Expr::TupleLit(vec![
                        p.child_by_field_name("key")
                            .map(|n| self.expression(n))
                            .unwrap_or(Expr::Unknown("key".to_string())),
                        self.field_expr(p, "value"),
                    ])
                });
                self.comprehension_with_element(
                    node,
                    element.unwrap_or(Expr::Unknown("comprehension".to_string())),
                )
            }
            "lambda" => {
                let params = node
                    .child_by_field_name("parameters")
                    .map(|n| {
                        self.parameters(n)
                            .into_iter()
                            .map(|p| p.name)
                            .collect()
                    })
                    .unwrap_or_default();
                Expr::Lambda {
                    params,
                    body: Box::new(self.field_expr(node, "body")),
                }
            }
            "string" | "concatenated_string" => {
                Expr::Literal(Literal::Str(string_content(self.node_text(node))))
            }
            "integer" => {
                let text = self.node_text(node).replace('_', "");
                match text.parse::<i64>() {
                    Ok(v) => Expr::Literal(Literal::Int(v)),
                    Err(_) => Expr::Unknown(text),
                }
            }
            "float" => {
                let text = self.node_text(node).replace('_', "");
                match text.parse::<f64>() {
                    Ok(v) => Expr::Literal(Literal::Float(v)),
                    Err(_) => Expr::Unknown(text),
                }
            }
            "true" => Expr::Literal(Literal::Bool(true)),
            "false" => Expr::Literal(Literal::Bool(false)),
            "none" => Expr::Literal(Literal::None),
            "parenthesized_expression" | "await" => node
                .named_child(0)
                .map(|n| self.expression(n))
                .unwrap_or(Expr::Unknown("empty".to_string())),
            "named_expression" => self.field_expr(node, "value"),
            "list_splat" | "dictionary_splat" => Expr::Starred(Box::new(
                node.named_child(0)
                    .map(|n| self.expression(n))
                    .unwrap_or(Expr::Unknown("splat".to_string())),
            )),
            other => {
                debug!(kind = other, "unmodeled expression kind");
                Expr::Unknown(self.node_text(node).to_string())
            }
        }
    }

    fn call(&self, node: Node) -> Expr {
        let callee = self.field_expr(node, "function");
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if let Some(arguments) = node.child_by_field_name("arguments") {
            let mut cursor = arguments.walk();
            for child in arguments.named_children(&mut cursor) {
                match child.kind() {
                    "keyword_argument" => kwargs.push((
                        self.field_text(child, "name"),
                        self.field_expr(child, "value"),
                    )),
                    "comment" => {}
                    _ => args.push(self.expression(child)),
                }
            }
        }
        Expr::Call {
            callee: Box::new(callee),
            args,
            kwargs,
        }
    }

    fn comprehension(&self, node: Node, element: Option<Expr>) -> Expr {
        let element = element.or_else(|| {
            node.child_by_field_name("body").map(|n| self.expression(n))
        });
        self.comprehension_with_element(
            node,
            element.unwrap_or(Expr::Unknown("comprehension".to_string())),
        )
    }

    fn comprehension_with_element(&self, node: Node, element: Expr) -> Expr {
        let mut bound = Vec::new();
        let mut sources = Vec::new();
        let mut conditions = Vec::new();
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "for_in_clause" => {
                    if let Some(left) = child.child_by_field_name("left") {
                        collect_target_names(&self.target(left), &mut bound);
                    }
                    if let Some(right) = child.child_by_field_name("right") {
                        sources.push(self.expression(right));
                    }
                }
                "if_clause" => {
                    if let Some(cond) = child.named_child(0) {
                        conditions.push(self.expression(cond));
                    }
                }
                _ => {}
            }
        }
        Expr::Comprehension {
            element: Box::new(element),
            bound,
            sources,
            conditions,
        }
    }

    fn child_expressions(&self, node: Node) -> Vec<Expr> {
        let mut cursor = node.walk();
        node.named_children(&mut cursor)
            .map(|child| self.expression(child))
            .collect()
    }

    fn field_expr(&self, node: Node, field: &str) -> Expr {
        node.child_by_field_name(field)
            .map(|n| self.expression(n))
            .unwrap_or(Expr::Unknown(field.to_string()))
    }

    fn field_block(&self, node: Node, field: &str) -> Vec<CfgNode> {
        node.child_by_field_name(field)
            .map(|n| self.build_block(n))
            .unwrap_or_default()
    }

    fn field_text(&self, node: Node, field: &str) -> String {
        node.child_by_field_name(field)
            .map(|n| self.node_text(n).to_string())
            .unwrap_or_default()
    }

    fn else_clause_block(&self, node: Node) -> Vec<CfgNode> {
        node.child_by_field_name("alternative")
            .map(|alt| self.field_block(alt, "body"))
            .unwrap_or_default()
    }
}

fn collect_target_names(target: &AssignTarget, out: &mut Vec<String>) {
    match target {
        AssignTarget::Name(name) => out.push(name.clone()),
        AssignTarget::Tuple(elements) => {
            for e in elements {
                collect_target_names(e, out);
            }
        }
        AssignTarget::Starred(inner) => collect_target_names(inner, out),
        AssignTarget::Attribute(..) | AssignTarget::Subscript(..) => {}
    }
}

/// Strip quotes and prefixes from a string literal's source text.
fn string_content(text: &str) -> String {
    let trimmed = text.trim_start_matches(|c: char| "rbufRBUF".contains(c));
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if trimmed.starts_with(quote) && trimmed.len() >= 2 * quote.len() {
            return trimmed[quote.len()..trimmed.len() - quote.len()].to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::value::{FuzzyBool, Value};

    fn run(source: &str) -> Frame {
        let nodes = build_module(source).unwrap();
        let mut frame = Frame::for_tests();
        for node in &nodes {
            node.process(&mut frame);
        }
        frame
    }

    #[test]
    fn test_simple_assignment() {
        let frame = run("x = 1 + 2\n");
        let v = frame.get_assignment("x").unwrap();
        assert_eq!(v.value_equals(&Value::int(3)), FuzzyBool::True);
    }

    #[test]
    fn test_tuple_unpacking_binds_all_names() {
        let frame = run("a, b = 1, 2\n");
        assert!(frame.get_assignment("a").is_ok());
        assert!(frame.get_assignment("b").is_ok());
    }

    #[test]
    fn test_resolved_if_picks_one_branch() {
        let frame = run("x = 1\nif x:\n    y = 2\nelse:\n    y = 3\n");
        let y = frame.get_assignment("y").unwrap();
        assert_eq!(y.value_equals(&Value::int(2)), FuzzyBool::True);
    }

    #[test]
    fn test_unresolved_if_merges_branches() {
        let frame = run("if unknown_condition:\n    y = 2\nelse:\n    y = 3\n");
        let y = frame.get_assignment("y").unwrap();
        assert!(y.is_fuzzy());
    }

    #[test]
    fn test_function_definition_and_call() {
        let frame = run("def add(a, b=10):\n    return a + b\n\nresult = add(1)\n");
        let result = frame.get_assignment("result").unwrap();
        assert_eq!(result.value_equals(&Value::int(11)), FuzzyBool::True);
    }

    #[test]
    fn test_class_definition_members() {
        let frame = run("class Widget:\n    size = 3\n    def draw(self):\n        pass\n");
        let class = frame.get_assignment("Widget").unwrap();
        assert_eq!(class.has_attribute("size"), FuzzyBool::True);
        assert_eq!(class.has_attribute("draw"), FuzzyBool::True);
    }

    #[test]
    fn test_instance_construction() {
        let frame = run(concat!(
            "class Point:\n",
            "    def __init__(self, x):\n",
            "        self.x = x\n",
            "p = Point(3)\n",
        ));
        let p = frame.get_assignment("p").unwrap();
        assert_eq!(p.get_attribute("x").value_equals(&Value::int(3)), FuzzyBool::True);
    }

    #[test]
    fn test_import_collection() {
        let nodes = build_module(concat!(
            "import os.path\n",
            "import numpy as np\n",
            "from collections import OrderedDict, defaultdict as dd\n",
            "from . import sibling\n",
        ))
        .unwrap();
        let mut imports = Vec::new();
        for node in &nodes {
            node.collect_imports(&mut imports);
        }
        let paths: Vec<&str> = imports.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["os.path", "numpy", "collections", "collections", "."]);
        assert_eq!(imports[1].alias.as_deref(), Some("np"));
        assert_eq!(imports[3].name.as_deref(), Some("defaultdict"));
        assert_eq!(imports[3].alias.as_deref(), Some("dd"));
    }

    #[test]
    fn test_wildcard_import_detected() {
        let nodes = build_module("from os.path import *\n").unwrap();
        match &nodes[0] {
            CfgNode::FromImport { path, names } => {
                assert_eq!(path, "os.path");
                assert_eq!(names[0].name, "*");
            }
            other => panic!("expected from-import, got {other:?}"),
        }
    }

    #[test]
    fn test_bound_names_cover_statement_forms() {
        let nodes = build_module(concat!(
            "x = 1\n",
            "for item in [1]:\n",
            "    pass\n",
            "with open('f') as fh:\n",
            "    pass\n",
            "try:\n",
            "    pass\n",
            "except ValueError as err:\n",
            "    pass\n",
            "def fn():\n",
            "    pass\n",
        ))
        .unwrap();
        let mut names = std::collections::HashSet::new();
        for node in &nodes {
            node.bound_names(&mut names);
        }
        for expected in ["x", "item", "fh", "err", "fn"] {
            assert!(names.contains(expected), "missing {expected}");
        }
    }

    #[test]
    fn test_comprehension_scopes_its_targets() {
        let nodes = build_module("squares = [n * n for n in values]\n").unwrap();
        match &nodes[0] {
            CfgNode::Assign { value, .. } => {
                let syms = value.free_symbols();
                assert!(syms.contains_key("values"));
                assert!(!syms.contains_key("n"));
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_comprehension_if_clause_uses_bound_name() {
        let nodes = build_module("big = [n for n in values if n > 2]\n").unwrap();
        match &nodes[0] {
            CfgNode::Assign { value, .. } => {
                let syms = value.free_symbols();
                assert!(syms.contains_key("values"));
                assert!(!syms.contains_key("n"), "filter variable leaked: {syms:?}");
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_def_sees_call_time_binding() {
        let frame = run(concat!(
            "def f():\n",
            "    def g():\n",
            "        return x\n",
            "    x = 1\n",
            "    return g()\n",
            "r = f()\n",
        ));
        let r = frame.get_assignment("r").unwrap();
        assert_eq!(r.value_equals(&Value::int(1)), FuzzyBool::True);
    }

    #[test]
    fn test_recursive_call_degrades_to_unknown() {
        let frame = run(concat!(
            "def f(n):\n",
            "    return f(n - 1)\n",
            "r = f(3)\n",
        ));
        let r = frame.get_assignment("r").unwrap();
        assert!(r.is_unknown());
    }

    #[test]
    fn test_string_content_strips_quotes() {
        assert_eq!(string_content("'abc'"), "abc");
        assert_eq!(string_content("\"\"\"doc\"\"\""), "doc");
        assert_eq!(string_content("f'x{y}'"), "x{y}");
    }

    #[test]
    fn test_unmodeled_syntax_degrades() {
        // match statements are not modeled but must not fail the build.
        let nodes = build_module("match x:\n    case 1:\n        pass\n");
        assert!(nodes.is_ok());
    }
}
