//! Preprocessing: escape normalization and source-map comment stripping.

use once_cell::sync::Lazy;
use regex::Regex;
use tree_sitter::Node;

use crate::deobfuscate::common::{apply_edits, get_node_text, visit_nodes, Edit};
use crate::deobfuscate::error::{DeobfuscateError, Result};
use crate::deobfuscate::parser::{count_syntax_errors, parse_tree, Dialect};

const STAGE: &str = "preprocess";

static SOURCE_MAP_COMMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?://[#@]\s*source(?:Mapping)?URL=.*|/\*[#@]\s*source(?:Mapping)?URL=(?s:.*)\*/)$")
        .expect("source map pattern is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessed {
    pub text: String,
    pub escapes_normalized: usize,
    pub source_maps_removed: usize,
}

/// Normalize printable escapes inside string literals and drop source-map comments
pub fn preprocess(text: &str, dialect: Dialect) -> Result<Preprocessed> {
    let tree = parse_tree(text, dialect)?;
    let root = tree.root_node();
    let source = text.as_bytes();

    let mut edits = Vec::new();
    let mut escapes_normalized = 0usize;
    let mut source_maps_removed = 0usize;

    visit_nodes(root, |node| match node.kind() {
        "string" => {
            escapes_normalized += collect_escape_edits(node, source, &mut edits);
            false
        }
        "comment" => {
            if SOURCE_MAP_COMMENT.is_match(get_node_text(node, source).trim_end()) {
                edits.push(Edit::replace(node, ""));
                source_maps_removed += 1;
            }
            false
        }
        _ => true,
    });

    if edits.is_empty() {
        return Ok(Preprocessed {
            text: text.to_string(),
            escapes_normalized,
            source_maps_removed,
        });
    }

    let rewritten = apply_edits(text, &edits).map_err(|e| DeobfuscateError::stage(STAGE, e))?;
    let (before, _) = count_syntax_errors(root);
    let after_tree = parse_tree(&rewritten, dialect)?;
    let (after, _) = count_syntax_errors(after_tree.root_node());
    if after > before {
        return Err(DeobfuscateError::stage(
            STAGE,
            format!("preprocessed text has more syntax errors ({} > {})", after, before),
        ));
    }

    Ok(Preprocessed {
        text: rewritten,
        escapes_normalized,
        source_maps_removed,
    })
}

fn collect_escape_edits(string: Node, source: &[u8], edits: &mut Vec<Edit>) -> usize {
    let quote = get_node_text(string, source).chars().next().unwrap_or('"');
    let mut count = 0usize;
    let mut cursor = string.walk();
    for child in string.children(&mut cursor) {
        if child.kind() != "escape_sequence" {
            continue;
        }
        let Some(ch) = decode_escape(get_node_text(child, source)) else {
            continue;
        };
        if !(' '..='~').contains(&ch) || ch == quote || ch == '\\' {
            continue;
        }
        edits.push(Edit::replace(child, ch.to_string()));
        count += 1;
    }
    count
}

/// Decode `\xHH`, `\uHHHH` and `\u{H..}` escapes
pub fn decode_escape(escape: &str) -> Option<char> {
    let body = escape.strip_prefix('\\')?;
    let hex = if let Some(rest) = body.strip_prefix('x') {
        (rest.len() == 2).then_some(rest)?
    } else if let Some(rest) = body.strip_prefix("u{") {
        rest.strip_suffix('}')?
    } else if let Some(rest) = body.strip_prefix('u') {
        (rest.len() == 4).then_some(rest)?
    } else {
        return None;
    };
    let code = u32::from_str_radix(hex, 16).ok()?;
    char::from_u32(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_escape_forms() {
        assert_eq!(decode_escape("\\x41"), Some('A'));
        assert_eq!(decode_escape("\\u0062"), Some('b'));
        assert_eq!(decode_escape("\\u{1F600}"), Some('😀'));
        assert_eq!(decode_escape("\\n"), None);
        assert_eq!(decode_escape("\\x4"), None);
    }

    #[test]
    fn test_normalizes_printable_escapes() {
        let out = preprocess(r#"var s = "\x48\x69!";"#, Dialect::JavaScript).unwrap();
        assert_eq!(out.text, r#"var s = "Hi!";"#);
        assert_eq!(out.escapes_normalized, 2);
    }

    #[test]
    fn test_keeps_quote_backslash_and_control_escapes() {
        let src = r#"var s = "\x22\x5c\x0a"; var t = '\x27';"#;
        let out = preprocess(src, Dialect::JavaScript).unwrap();
        assert_eq!(out.text, src);
        assert_eq!(out.escapes_normalized, 0);
    }

    #[test]
    fn test_strips_source_map_comments() {
        let src = "var a = 1;\n//# sourceMappingURL=app.js.map\n/*# sourceMappingURL=x.map */\n// keep me\n";
        let out = preprocess(src, Dialect::JavaScript).unwrap();
        assert_eq!(out.source_maps_removed, 2);
        assert!(!out.text.contains("sourceMappingURL"));
        assert!(out.text.contains("// keep me"));
    }

    #[test]
    fn test_template_strings_untouched() {
        let src = "var s = `\\x41${b}`;";
        let out = preprocess(src, Dialect::JavaScript).unwrap();
        assert_eq!(out.text, src);
    }
}
