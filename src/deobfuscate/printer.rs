//! Code generation and pretty-printing.
//!
//! Generation is the identity on a unit's text: every AST rewrite has already
//! been applied as byte edits. Pretty-printing re-lays the leaf tokens of a
//! clean tree with two-space indentation.

use tree_sitter::Node;

use crate::deobfuscate::common::get_node_text;
use crate::deobfuscate::error::{DeobfuscateError, Result};
use crate::deobfuscate::parser::SourceUnit;

// ============ Constants ============

const INDENT: &str = "  ";

/// Nodes emitted verbatim, never split into tokens
const ATOMIC_KINDS: &[&str] = &[
    "string",
    "template_string",
    "regex",
    "comment",
    "html_comment",
    "hash_bang_line",
    "number",
    "jsx_element",
    "jsx_self_closing_element",
    "jsx_fragment",
];

const SPACED_OPERATORS: &[&str] = &[
    "=", "==", "===", "!=", "!==", "<", ">", "<=", ">=", "+", "-", "*", "/", "%", "**", "&",
    "|", "^", "<<", ">>", ">>>", "&&", "||", "??", "+=", "-=", "*=", "/=", "%=", "**=", "&=",
    "|=", "^=", "<<=", ">>=", ">>>=", "&&=", "||=", "??=", "?", ":", "=>",
];

const SPACED_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "with", "return", "typeof", "void", "delete",
    "new", "throw", "case", "in", "of", "instanceof", "else", "do", "yield", "await", "export",
    "default", "extends", "const", "let", "var", "async", "static", "import", "from", "as",
];

// ============ Generation ============

/// AST to text
pub fn generate(unit: &SourceUnit) -> String {
    unit.text().to_string()
}

// ============ Pretty Printing ============

struct Token<'a> {
    text: &'a str,
    kind: &'a str,
    parent: &'a str,
    /// Line breaks in the original gap before this token
    breaks_before: usize,
}

/// Re-layout a clean unit; fails for trees with syntax errors
pub fn beautify(unit: &SourceUnit) -> Result<String> {
    if unit.syntax_errors() > 0 {
        return Err(DeobfuscateError::stage(
            "format",
            "refusing to re-layout a tree with syntax errors",
        ));
    }
    let tokens = collect_tokens(unit.root(), unit.source());
    let mut out = layout(&tokens);
    if !out.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Beautify and verify the result still parses cleanly
pub fn beautify_checked(unit: &SourceUnit, stage: &'static str) -> Result<SourceUnit> {
    let text = beautify(unit)?;
    let formatted = unit.reparse(stage, text)?;
    if formatted.syntax_errors() > 0 {
        return Err(DeobfuscateError::stage(stage, "formatted output no longer parses"));
    }
    Ok(formatted)
}

fn collect_tokens<'a>(root: Node<'a>, source: &'a [u8]) -> Vec<Token<'a>> {
    let mut tokens = Vec::new();
    let mut last_end = 0usize;
    let mut cursor = root.walk();
    let mut stack: Vec<(Node<'a>, &'a str)> = vec![(root, "")];

    // Explicit stack in reverse child order keeps source order without recursion
    while let Some((node, parent)) = stack.pop() {
        let atomic = ATOMIC_KINDS.contains(&node.kind());
        if !atomic && node.child_count() > 0 {
            let children: Vec<Node<'a>> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev().map(|child| (child, node.kind())));
            continue;
        }
        if node.start_byte() == node.end_byte() {
            continue;
        }
        let gap = source.get(last_end..node.start_byte()).unwrap_or(&[]);
        let breaks_before = gap.iter().filter(|&&b| b == b'\n').count();
        last_end = node.end_byte();
        tokens.push(Token {
            text: get_node_text(node, source),
            kind: node.kind(),
            parent,
            breaks_before,
        });
    }
    tokens
}

fn layout(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut indent = 0usize;
    let mut brackets: Vec<(&str, &str)> = Vec::new();
    let mut pending_newline = false;
    let mut at_line_start = true;

    for (i, tok) in tokens.iter().enumerate() {
        let prev = if i > 0 { Some(&tokens[i - 1]) } else { None };
        let next = tokens.get(i + 1);
        let closes_block = tok.kind == "}" && prev.map_or(true, |p| p.kind != "{");

        if closes_block {
            indent = indent.saturating_sub(1);
            pending_newline = true;
        }

        let original_break = tok.breaks_before > 0 && i > 0;
        if (pending_newline || original_break) && !at_line_start {
            out.push('\n');
            if tok.breaks_before > 1 {
                out.push('\n');
            }
            at_line_start = true;
        }
        pending_newline = false;

        if at_line_start {
            for _ in 0..indent {
                out.push_str(INDENT);
            }
        } else if let Some(prev) = prev {
            if space_between(prev, tok) {
                out.push(' ');
            }
        }
        out.push_str(tok.text);
        at_line_start = false;

        match tok.kind {
            "{" => {
                brackets.push(("{", tok.parent));
                if next.map_or(false, |n| n.kind != "}") {
                    indent += 1;
                    pending_newline = true;
                }
            }
            "(" | "[" => brackets.push((tok.kind, tok.parent)),
            ")" | "]" => {
                brackets.pop();
            }
            "}" => {
                brackets.pop();
                pending_newline = !next.map_or(false, |n| continues_after_brace(n));
            }
            ";" => {
                let in_parens = matches!(brackets.last(), Some((open, _)) if *open == "(");
                pending_newline = !in_parens;
            }
            "," => {
                pending_newline = matches!(brackets.last(), Some(("{", "object")));
            }
            "comment" if tok.text.starts_with("//") => pending_newline = true,
            "hash_bang_line" | "html_comment" => pending_newline = true,
            _ => {}
        }
    }

    collapse_blank_lines(&out)
}

fn continues_after_brace(next: &Token) -> bool {
    matches!(next.text, ";" | "," | ")" | "]" | "." | "?." | "(" | "else" | "catch" | "finally")
        || (next.text == "while" && next.parent == "do_statement")
}

fn space_between(prev: &Token, next: &Token) -> bool {
    let p = prev.text;
    let n = next.text;

    // Separations required for the output to tokenize identically
    if word_end(p) && word_start(n) {
        return true;
    }
    if (p.ends_with('+') && n.starts_with('+')) || (p.ends_with('-') && n.starts_with('-')) {
        return true;
    }
    if p.ends_with('/') && (n.starts_with('/') || n.starts_with('*')) {
        return true;
    }
    if prev.kind == "number" && n == "." {
        return true;
    }
    if prev.kind == "comment" || next.kind == "comment" {
        return true;
    }

    if matches!(n, ";" | "," | ")" | "]" | "." | "?.") {
        return false;
    }
    if matches!(p, "(" | "[" | "." | "?." | "..." | "!" | "~" | "#") {
        return false;
    }
    if matches!(p, "++" | "--") && prev.parent == "update_expression" && word_start(n) {
        return false;
    }
    if matches!(n, "++" | "--") && next.parent == "update_expression" && word_end(p) {
        return false;
    }
    if matches!(p, "-" | "+") && prev.parent == "unary_expression" {
        return false;
    }
    if n == ":" && next.parent != "ternary_expression" {
        return false;
    }
    if matches!(p, "<" | ">") && matches!(prev.parent, "type_arguments" | "type_parameters") {
        return false;
    }
    if matches!(n, "<" | ">") && matches!(next.parent, "type_arguments" | "type_parameters") {
        return false;
    }
    if n == "(" || n == "[" {
        return SPACED_KEYWORDS.contains(&p) || is_spaced_operator(prev) || p == ",";
    }
    if n == "{" {
        return true;
    }
    if is_spaced_operator(prev) || is_spaced_operator(next) {
        return true;
    }
    if matches!(p, "," | ";" | ":" | "}") {
        return true;
    }
    if p == ")" && !matches!(n, "(" | "[") {
        return true;
    }
    SPACED_KEYWORDS.contains(&p)
}

fn is_spaced_operator(tok: &Token) -> bool {
    if tok.parent == "unary_expression" || tok.parent == "update_expression" {
        return false;
    }
    SPACED_OPERATORS.contains(&tok.text)
}

fn word_end(text: &str) -> bool {
    text.chars()
        .last()
        .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii())
}

fn word_start(text: &str) -> bool {
    text.chars()
        .next()
        .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '$' || c == '#' || !c.is_ascii())
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let trimmed_end = line.trim_end();
        if trimmed_end.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed_end);
        out.push('\n');
    }
    out
}
