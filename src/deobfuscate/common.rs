//! Common types and utilities shared across all pipeline stages.

use std::collections::HashSet;

use serde::Serialize;
use tree_sitter::Node;

// ============ Threshold Constants ============

pub const MAX_SNIPPET_LEN: usize = 120;
pub const MAX_JUMP_EXPR_LEN: usize = 60;

// ============ Findings ============

/// 1-based inclusive line span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub start_line: usize,
    pub end_line: usize,
}

impl Location {
    pub fn of(node: Node) -> Self {
        Self {
            start_line: node.start_position().row + 1,
            end_line: node.end_position().row + 1,
        }
    }

    /// Line span of a byte range in raw text
    pub fn of_range(text: &str, start: usize, end: usize) -> Self {
        let start = start.min(text.len());
        let end = end.min(text.len()).max(start);
        let start_line = text.as_bytes()[..start].iter().filter(|&&b| b == b'\n').count() + 1;
        let end_line = start_line + text.as_bytes()[start..end].iter().filter(|&&b| b == b'\n').count();
        Self { start_line, end_line }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub category: String,
    pub description: String,
    pub snippet: String,
    pub location: Location,
}

/// Append-only finding list holding at most one entry per category
#[derive(Debug, Default, Clone)]
pub struct FindingSet {
    findings: Vec<Finding>,
    seen: HashSet<String>,
}

impl FindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finding; returns false when the category already fired
    pub fn push(&mut self, finding: Finding) -> bool {
        if self.seen.contains(&finding.category) {
            return false;
        }
        self.seen.insert(finding.category.clone());
        self.findings.push(finding);
        true
    }

    pub fn contains(&self, category: &str) -> bool {
        self.seen.contains(category)
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn into_vec(self) -> Vec<Finding> {
        self.findings
    }

    pub fn as_slice(&self) -> &[Finding] {
        &self.findings
    }
}

// ============ Source Edits ============

/// Replacement of the byte range `start..end`; `start == end` is an insertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Edit {
    pub fn replace(node: Node, text: impl Into<String>) -> Self {
        Self {
            start: node.start_byte(),
            end: node.end_byte(),
            text: text.into(),
        }
    }

    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self {
            start: at,
            end: at,
            text: text.into(),
        }
    }

    pub fn is_insertion(&self) -> bool {
        self.start == self.end
    }
}

/// Apply non-overlapping edits to `text`.
///
/// Insertions at the same offset keep their relative order. Overlapping
/// replacements are rejected rather than guessed at.
pub fn apply_edits(text: &str, edits: &[Edit]) -> Result<String, String> {
    let mut sorted: Vec<(usize, &Edit)> = edits.iter().enumerate().collect();
    sorted.sort_by(|(ia, a), (ib, b)| {
        a.start
            .cmp(&b.start)
            .then(b.is_insertion().cmp(&a.is_insertion()))
            .then(ia.cmp(ib))
    });

    let mut out = String::with_capacity(text.len() + edits.len() * 8);
    let mut cursor = 0usize;
    for (_, edit) in sorted {
        if edit.end < edit.start || edit.end > text.len() {
            return Err(format!("edit {}..{} is out of bounds", edit.start, edit.end));
        }
        if edit.start < cursor {
            return Err(format!("edit {}..{} overlaps a previous edit", edit.start, edit.end));
        }
        if !text.is_char_boundary(edit.start) || !text.is_char_boundary(edit.end) {
            return Err(format!("edit {}..{} splits a character", edit.start, edit.end));
        }
        out.push_str(&text[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

// ============ Tree Walking ============

/// Visitor for `walk_tree`; `enter` returns whether to descend into children
pub trait TreeVisitor<'t> {
    fn enter(&mut self, node: Node<'t>) -> bool;
    fn leave(&mut self, _node: Node<'t>) {}
}

/// Iterative pre-order walk, safe for deeply nested minified input
pub fn walk_tree<'t, V: TreeVisitor<'t>>(root: Node<'t>, visitor: &mut V) {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        let descend = visitor.enter(node);
        if descend && cursor.goto_first_child() {
            continue;
        }
        if !descend || node.child_count() == 0 {
            visitor.leave(node);
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
            visitor.leave(cursor.node());
            if cursor.node().id() == root.id() {
                return;
            }
        }
        if cursor.node().id() == root.id() {
            return;
        }
    }
}

struct FnVisitor<F>(F);

impl<'t, F: FnMut(Node<'t>) -> bool> TreeVisitor<'t> for FnVisitor<F> {
    fn enter(&mut self, node: Node<'t>) -> bool {
        (self.0)(node)
    }
}

/// Pre-order walk with a closure deciding whether to descend
pub fn visit_nodes<'t>(root: Node<'t>, f: impl FnMut(Node<'t>) -> bool) {
    walk_tree(root, &mut FnVisitor(f));
}

/// Named children of a node, in order
pub fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

pub fn is_function_boundary(kind: &str) -> bool {
    matches!(
        kind,
        "function_declaration"
            | "function_expression"
            | "function"
            | "arrow_function"
            | "method_definition"
            | "generator_function"
            | "generator_function_declaration"
    )
}

// ============ Text Utilities ============

/// Get text content of a tree-sitter node
pub fn get_node_text<'a>(node: Node, source: &'a [u8]) -> &'a str {
    let start = node.start_byte();
    let end = node.end_byte();
    let slice = source.get(start..end).unwrap_or(&[]);
    std::str::from_utf8(slice).unwrap_or("")
}

/// Truncate a line to a maximum length, adding "..." if truncated
pub fn truncate_line(line: &str, max_len: usize) -> String {
    let mut out = String::new();
    let mut truncated = false;
    for (count, ch) in line.chars().enumerate() {
        if count >= max_len {
            truncated = true;
            break;
        }
        out.push(ch);
    }
    if truncated {
        out.push_str("...");
    }
    out
}

/// Collapse whitespace runs to single spaces
pub fn compact_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compacted, truncated rendering of a node for reports
pub fn snippet(node: Node, source: &[u8]) -> String {
    truncate_line(&compact_whitespace(get_node_text(node, source)), MAX_SNIPPET_LEN)
}

pub fn is_identifier_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

pub fn is_reserved_word(name: &str) -> bool {
    matches!(
        name,
        "break" | "case" | "catch" | "class" | "const" | "continue" | "debugger" | "default"
            | "delete" | "do" | "else" | "enum" | "export" | "extends" | "false" | "finally"
            | "for" | "function" | "if" | "import" | "in" | "instanceof" | "new" | "null"
            | "return" | "super" | "switch" | "this" | "throw" | "true" | "try" | "typeof"
            | "var" | "void" | "while" | "with" | "yield" | "let" | "static" | "implements"
            | "interface" | "package" | "private" | "protected" | "public" | "await"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deobfuscate::parser::{parse_tree, Dialect};

    #[test]
    fn test_apply_edits_in_order() {
        let edits = vec![
            Edit { start: 4, end: 5, text: "B".into() },
            Edit { start: 0, end: 1, text: "A".into() },
            Edit::insert(8, "!"),
        ];
        assert_eq!(apply_edits("a + b + c", &edits).unwrap(), "A + B + !c");
    }

    #[test]
    fn test_apply_edits_rejects_overlap() {
        let edits = vec![
            Edit { start: 0, end: 5, text: "x".into() },
            Edit { start: 2, end: 3, text: "y".into() },
        ];
        assert!(apply_edits("abcdef", &edits).is_err());
    }

    #[test]
    fn test_insertions_at_same_offset_keep_order() {
        let edits = vec![Edit::insert(1, "1"), Edit::insert(1, "2")];
        assert_eq!(apply_edits("ab", &edits).unwrap(), "a12b");
    }

    #[test]
    fn test_finding_set_dedups_by_category() {
        let mut set = FindingSet::new();
        let finding = Finding {
            category: "logging".into(),
            description: "console".into(),
            snippet: "console.log(1)".into(),
            location: Location { start_line: 1, end_line: 1 },
        };
        assert!(set.push(finding.clone()));
        assert!(!set.push(Finding { snippet: "other".into(), ..finding }));
        assert_eq!(set.len(), 1);
        assert_eq!(set.as_slice()[0].snippet, "console.log(1)");
    }

    #[test]
    fn test_location_of_range() {
        let text = "a\nbb\nccc";
        assert_eq!(Location::of_range(text, 2, 4), Location { start_line: 2, end_line: 2 });
        assert_eq!(Location::of_range(text, 0, text.len()), Location { start_line: 1, end_line: 3 });
    }

    #[test]
    fn test_walk_tree_visits_every_node_once() {
        let source = "if (a) { b(); } else { c = [1, 2]; }";
        let tree = parse_tree(source, Dialect::JavaScript).unwrap();
        let mut entered = 0usize;
        let mut kinds = Vec::new();
        visit_nodes(tree.root_node(), |node| {
            entered += 1;
            if node.is_named() {
                kinds.push(node.kind());
            }
            true
        });
        let mut expected = 0usize;
        let mut stack = vec![tree.root_node()];
        while let Some(node) = stack.pop() {
            expected += 1;
            let mut cursor = node.walk();
            stack.extend(node.children(&mut cursor));
        }
        assert_eq!(entered, expected);
        assert_eq!(kinds[0], "program");
        assert!(kinds.contains(&"array"));
    }

    #[test]
    fn test_identifier_names() {
        assert!(is_identifier_name("_0xabc"));
        assert!(is_identifier_name("$el"));
        assert!(!is_identifier_name("1abc"));
        assert!(!is_identifier_name("a-b"));
        assert!(is_reserved_word("class"));
        assert!(!is_reserved_word("klass"));
    }
}
