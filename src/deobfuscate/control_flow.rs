//! Control-flow inventory: branches with a complexity score, plus jump sites.
//!
//! This is a reporting inventory. No reachability or dominance analysis is done.

use serde::Serialize;
use tree_sitter::Node;

use crate::deobfuscate::common::{
    compact_whitespace, get_node_text, is_function_boundary, snippet, truncate_line, visit_nodes,
    Location, MAX_JUMP_EXPR_LEN,
};
use crate::deobfuscate::parser::SourceUnit;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    /// `if`, `switch` or `while`
    pub kind: String,
    pub complexity: u32,
    pub condition: String,
    pub location: Location,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlFlowInventory {
    pub branches: Vec<BranchInfo>,
    pub jumps: Vec<String>,
}

/// Collect branches and canonical jump strings in source order
pub fn inventory(unit: &SourceUnit) -> ControlFlowInventory {
    let source = unit.source();
    let mut out = ControlFlowInventory::default();

    visit_nodes(unit.root(), |node| {
        match node.kind() {
            "if_statement" | "while_statement" | "switch_statement" => {
                out.branches.push(branch_info(node, source));
            }
            "break_statement" | "continue_statement" | "return_statement" | "throw_statement"
            | "labeled_statement" => {
                if let Some(jump) = canonical_jump(node, source) {
                    out.jumps.push(jump);
                }
            }
            _ => {}
        }
        true
    });

    out
}

fn branch_info(node: Node, source: &[u8]) -> BranchInfo {
    let (kind, condition_field) = match node.kind() {
        "if_statement" => ("if", "condition"),
        "while_statement" => ("while", "condition"),
        _ => ("switch", "value"),
    };
    let condition = node
        .child_by_field_name(condition_field)
        .map(|c| snippet(c, source))
        .unwrap_or_default();
    BranchInfo {
        kind: kind.to_string(),
        complexity: complexity(node, source),
        condition,
        location: Location::of(node),
    }
}

/// 1 + nested conditions, logical operators, loops, switch cases,
/// and every return beyond the first. Nested functions are not counted.
pub fn complexity(node: Node, source: &[u8]) -> u32 {
    let mut score = 1u32;
    let mut returns = 0u32;
    let root_id = node.id();

    visit_nodes(node, |n| {
        if n.id() == root_id {
            return true;
        }
        if is_function_boundary(n.kind()) || n.kind() == "class_body" {
            return false;
        }
        match n.kind() {
            "if_statement" | "ternary_expression" => score += 1,
            "for_statement" | "for_in_statement" | "while_statement" | "do_statement" => score += 1,
            "switch_case" => score += 1,
            "return_statement" => returns += 1,
            "binary_expression" => {
                let op = n.child_by_field_name("operator").map(|o| get_node_text(o, source));
                if matches!(op, Some("&&" | "||" | "??")) {
                    score += 1;
                }
            }
            _ => {}
        }
        true
    });

    score + returns.saturating_sub(1)
}

/// `break`, `break L`, `continue L`, `return <expr>`, `throw <expr>`, `label L`
pub fn canonical_jump(node: Node, source: &[u8]) -> Option<String> {
    let jump = match node.kind() {
        "break_statement" | "continue_statement" => {
            let keyword = if node.kind() == "break_statement" { "break" } else { "continue" };
            match node.child_by_field_name("label") {
                Some(label) => format!("{} {}", keyword, get_node_text(label, source)),
                None => keyword.to_string(),
            }
        }
        "return_statement" | "throw_statement" => {
            let keyword = if node.kind() == "return_statement" { "return" } else { "throw" };
            match first_expression(node) {
                Some(expr) => format!("{} {}", keyword, jump_expr(expr, source)),
                None => keyword.to_string(),
            }
        }
        "labeled_statement" => {
            let label = node.child_by_field_name("label")?;
            format!("label {}", get_node_text(label, source))
        }
        _ => return None,
    };
    Some(jump)
}

fn first_expression(node: Node) -> Option<Node> {
    let mut cursor = node.walk();
    let found = node
        .named_children(&mut cursor)
        .find(|child| child.kind() != "comment");
    found
}

fn jump_expr(expr: Node, source: &[u8]) -> String {
    truncate_line(&compact_whitespace(get_node_text(expr, source)), MAX_JUMP_EXPR_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deobfuscate::parser::{parse_strict, Dialect};

    fn run(code: &str) -> ControlFlowInventory {
        let unit = parse_strict(code, Dialect::JavaScript).unwrap();
        inventory(&unit)
    }

    #[test]
    fn test_simple_if_has_base_complexity() {
        let inv = run("if (a) { b(); }");
        assert_eq!(inv.branches.len(), 1);
        assert_eq!(inv.branches[0].kind, "if");
        assert_eq!(inv.branches[0].complexity, 1);
        assert_eq!(inv.branches[0].condition, "(a)");
    }

    #[test]
    fn test_complexity_counts_nested_structure() {
        let code = "function f(x) {\n  if (x && y || z) {\n    for (;;) { if (q) { return 1; } }\n    return 2;\n  }\n}";
        let inv = run(code);
        let outer = &inv.branches[0];
        // base 1 + && + || + for + nested if + one extra return
        assert_eq!(outer.complexity, 6);
        assert_eq!(outer.location.start_line, 2);
        assert_eq!(inv.branches.len(), 2);
    }

    #[test]
    fn test_switch_cases_and_nested_functions() {
        let code = "switch (k) { case 1: g(); break; case 2: h(function () { if (a) {} }); break; default: }";
        let inv = run(code);
        let switch = inv.branches.iter().find(|b| b.kind == "switch").unwrap();
        assert_eq!(switch.complexity, 3);
        assert_eq!(switch.condition, "(k)");
        assert_eq!(inv.branches.iter().filter(|b| b.kind == "if").count(), 1);
    }

    #[test]
    fn test_canonical_jumps() {
        let code = "outer: while (a) { if (b) continue outer; if (c) break; }\nfunction f() { if (x) return; throw   new   Error('x'); return a +\n b; }";
        let inv = run(code);
        assert_eq!(
            inv.jumps,
            vec![
                "label outer",
                "continue outer",
                "break",
                "return",
                "throw new Error('x')",
                "return a + b",
            ]
        );
    }

    #[test]
    fn test_long_return_expression_is_truncated() {
        let long = format!("return {};", vec!["value"; 30].join(" + "));
        let inv = run(&format!("function f(value) {{ {} }}", long));
        assert!(inv.jumps[0].starts_with("return value + value"));
        assert!(inv.jumps[0].ends_with("..."));
    }
}
