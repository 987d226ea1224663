//! Obfuscation-shape detection: string arrays, packers, flattening and friends.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tree_sitter::Node;

use crate::deobfuscate::common::{
    get_node_text, named_children, snippet, truncate_line, visit_nodes, Finding, FindingSet,
    Location, MAX_SNIPPET_LEN,
};
use crate::deobfuscate::fold::string_literal_value;
use crate::deobfuscate::parser::SourceUnit;

// ============ Threshold Constants ============

const MIN_STRING_ARRAY_LEN: usize = 5;
const MIN_HEX_IDENTIFIERS: usize = 5;
const MIN_HEX_ESCAPES: usize = 20;
/// Escaped bytes per source byte above which escaping is "heavy"
const HEX_ESCAPE_DENSITY: f32 = 0.05;
const MINIFIED_MIN_BYTES: usize = 500;
const MINIFIED_AVG_LINE_LEN: usize = 200;

static HEX_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_0x[0-9a-fA-F]+$").expect("hex identifier pattern is valid"));
static HEX_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\x[0-9a-fA-F]{2}|\\u[0-9a-fA-F]{4}").expect("hex escape pattern is valid")
});
static SPLIT_ORDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"["'][0-9]+(?:\|[0-9]+)+["']\s*\.\s*split\s*\(\s*["']\|["']\s*\)"#)
        .expect("split order pattern is valid")
});

/// Summary of obfuscation signatures found in one unit
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObfuscationShape {
    pub string_arrays: usize,
    pub rotation_iife: bool,
    pub hex_identifiers: usize,
    pub packer: bool,
    pub control_flow_flattening: bool,
    pub hex_escapes: usize,
    pub minified: bool,
}

impl ObfuscationShape {
    pub fn is_obfuscated(&self) -> bool {
        self.string_arrays > 0
            || self.rotation_iife
            || self.hex_identifiers >= MIN_HEX_IDENTIFIERS
            || self.packer
            || self.control_flow_flattening
    }
}

/// Detect obfuscation signatures; `original` is the untouched input text
pub fn detect_shape(unit: &SourceUnit, original: &str, findings: &mut FindingSet) -> ObfuscationShape {
    let root = unit.root();
    let source = unit.source();
    let mut shape = ObfuscationShape::default();
    let mut hex_names: HashSet<&str> = HashSet::new();
    let mut first_hex_name: Option<Node> = None;
    let has_split_order = SPLIT_ORDER.is_match(unit.text());

    visit_nodes(root, |node| {
        match node.kind() {
            "variable_declarator" => {
                if let Some(array) = node.child_by_field_name("value").filter(|v| v.kind() == "array") {
                    if is_string_array(array, source) {
                        shape.string_arrays += 1;
                        push(findings, "obfuscation.string_array", "Array of encoded string constants", node, source);
                    }
                }
            }
            "call_expression" => {
                if is_rotation_call(node, source) {
                    shape.rotation_iife = true;
                    push(findings, "obfuscation.array_rotation", "String array rotated by push/shift loop", node, source);
                }
                if is_packer_call(node, source) {
                    shape.packer = true;
                    push(findings, "obfuscation.packer", "eval/Function packed payload", node, source);
                }
            }
            "new_expression" => {
                let constructor = node.child_by_field_name("constructor");
                if constructor.map_or(false, |c| get_node_text(c, source) == "Function") {
                    shape.packer = true;
                    push(findings, "obfuscation.packer", "eval/Function packed payload", node, source);
                }
            }
            "while_statement" | "for_statement" => {
                if has_split_order && is_infinite_loop(node, source) && contains_switch(node) {
                    shape.control_flow_flattening = true;
                    push(
                        findings,
                        "obfuscation.control_flow_flattening",
                        "Dispatcher loop driven by a split('|') order string",
                        node,
                        source,
                    );
                }
            }
            "identifier" => {
                let name = get_node_text(node, source);
                if HEX_IDENTIFIER.is_match(name) {
                    hex_names.insert(name);
                    first_hex_name.get_or_insert(node);
                }
            }
            _ => {}
        }
        true
    });

    shape.hex_identifiers = hex_names.len();
    if shape.hex_identifiers >= MIN_HEX_IDENTIFIERS {
        if let Some(node) = first_hex_name {
            push(
                findings,
                "obfuscation.hex_identifiers",
                &format!("{} distinct _0x-style identifiers", shape.hex_identifiers),
                node,
                source,
            );
        }
    }

    detect_text_signals(original, &mut shape, findings);
    shape
}

fn detect_text_signals(original: &str, shape: &mut ObfuscationShape, findings: &mut FindingSet) {
    let escapes: Vec<_> = HEX_ESCAPE.find_iter(original).collect();
    shape.hex_escapes = escapes.len();
    let escaped_bytes: usize = escapes.iter().map(|m| m.len()).sum();
    let density = escaped_bytes as f32 / original.len().max(1) as f32;
    if escapes.len() >= MIN_HEX_ESCAPES && density >= HEX_ESCAPE_DENSITY {
        let first = &escapes[0];
        findings.push(Finding {
            category: "obfuscation.hex_escapes".to_string(),
            description: format!("{} hex/unicode escapes in string literals", escapes.len()),
            snippet: line_snippet(original, first.start()),
            location: Location::of_range(original, first.start(), first.end()),
        });
    }

    let lines = original.lines().count().max(1);
    if original.len() >= MINIFIED_MIN_BYTES && original.len() / lines >= MINIFIED_AVG_LINE_LEN {
        shape.minified = true;
        findings.push(Finding {
            category: "obfuscation.minified".to_string(),
            description: format!("Average line length {} bytes", original.len() / lines),
            snippet: line_snippet(original, 0),
            location: Location::of_range(original, 0, 0),
        });
    }
}

fn push(findings: &mut FindingSet, category: &str, description: &str, node: Node, source: &[u8]) {
    findings.push(Finding {
        category: category.to_string(),
        description: description.to_string(),
        snippet: snippet(node, source),
        location: Location::of(node),
    });
}

fn line_snippet(text: &str, offset: usize) -> String {
    let start = text[..offset].rfind('\n').map_or(0, |i| i + 1);
    let end = text[offset..].find('\n').map_or(text.len(), |i| offset + i);
    truncate_line(text[start..end].trim(), MAX_SNIPPET_LEN)
}

// ============ Node Predicates ============

fn is_string_array(array: Node, source: &[u8]) -> bool {
    let elements = named_children(array);
    elements.len() >= MIN_STRING_ARRAY_LEN
        && elements
            .iter()
            .all(|e| e.kind() == "string" && string_literal_value(*e, source).is_some())
}

/// Property name of a member or string-subscript callee
fn callee_property(callee: Node, source: &[u8]) -> Option<String> {
    match callee.kind() {
        "member_expression" => callee
            .child_by_field_name("property")
            .map(|p| get_node_text(p, source).to_string()),
        "subscript_expression" => {
            let index = callee.child_by_field_name("index")?;
            if index.kind() == "string" {
                string_literal_value(index, source)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_rotation_call(call: Node, source: &[u8]) -> bool {
    let Some(callee) = call.child_by_field_name("function") else {
        return false;
    };
    if callee_property(callee, source).as_deref() != Some("push") {
        return false;
    }
    let Some(arguments) = call.child_by_field_name("arguments") else {
        return false;
    };
    named_children(arguments).into_iter().any(|arg| {
        arg.kind() == "call_expression"
            && arg
                .child_by_field_name("function")
                .and_then(|f| callee_property(f, source))
                .as_deref()
                == Some("shift")
    })
}

fn is_packer_call(call: Node, source: &[u8]) -> bool {
    let Some(callee) = call.child_by_field_name("function") else {
        return false;
    };
    if get_node_text(callee, source) != "eval" {
        return false;
    }
    let Some(first) = call
        .child_by_field_name("arguments")
        .and_then(|args| args.named_child(0))
    else {
        return false;
    };
    match first.kind() {
        "function_expression" | "function" => true,
        "call_expression" => first.child_by_field_name("function").map_or(false, |f| {
            let inner = if f.kind() == "parenthesized_expression" {
                f.named_child(0).unwrap_or(f)
            } else {
                f
            };
            matches!(inner.kind(), "function_expression" | "function")
        }),
        _ => false,
    }
}

fn is_infinite_loop(node: Node, source: &[u8]) -> bool {
    match node.kind() {
        "while_statement" => node.child_by_field_name("condition").map_or(false, |c| {
            let text: String = get_node_text(c, source).chars().filter(|c| !c.is_whitespace()).collect();
            matches!(text.as_str(), "(!![])" | "(true)" | "(!0)" | "(1)")
        }),
        "for_statement" => node.child_by_field_name("condition").map_or(true, |c| {
            let text = get_node_text(c, source).trim();
            text.is_empty() || text == ";"
        }),
        _ => false,
    }
}

fn contains_switch(node: Node) -> bool {
    let mut found = false;
    visit_nodes(node, |n| {
        if n.kind() == "switch_statement" {
            found = true;
        }
        !found
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deobfuscate::parser::{parse_strict, Dialect};

    fn shape_of(code: &str) -> (ObfuscationShape, FindingSet) {
        let unit = parse_strict(code, Dialect::JavaScript).unwrap();
        let mut findings = FindingSet::new();
        let shape = detect_shape(&unit, code, &mut findings);
        (shape, findings)
    }

    #[test]
    fn test_string_array_and_rotation() {
        let code = r#"
var _0x1a2b = ["log", "Hello", "World", "push", "shift"];
(function (arr, n) { while (--n) { arr["push"](arr["shift"]()); } })(_0x1a2b, 0x1f);
"#;
        let (shape, findings) = shape_of(code);
        assert_eq!(shape.string_arrays, 1);
        assert!(shape.rotation_iife);
        assert!(findings.contains("obfuscation.string_array"));
        assert!(findings.contains("obfuscation.array_rotation"));
        assert!(shape.is_obfuscated());
    }

    #[test]
    fn test_hex_identifiers_threshold() {
        let code = "var _0xa = 1, _0xb = 2, _0xc = 3, _0xd = 4; var _0xe = _0xa + _0xb;";
        let (shape, findings) = shape_of(code);
        assert_eq!(shape.hex_identifiers, 5);
        assert!(findings.contains("obfuscation.hex_identifiers"));

        let (shape, findings) = shape_of("var _0xa = 1, _0xb = 2;");
        assert_eq!(shape.hex_identifiers, 2);
        assert!(!findings.contains("obfuscation.hex_identifiers"));
    }

    #[test]
    fn test_packer() {
        let code = "eval(function(p,a,c,k,e,d){return p}('0 1',2,2,'a|b'.split('|'),0,{}));";
        let (shape, findings) = shape_of(code);
        assert!(shape.packer);
        assert!(findings.contains("obfuscation.packer"));
    }

    #[test]
    fn test_control_flow_flattening() {
        let code = r#"
var order = "2|0|1".split("|"), i = 0;
while (!![]) {
  switch (order[i++]) {
    case "0": a(); continue;
    case "1": b(); continue;
    case "2": c(); continue;
  }
  break;
}
"#;
        let (shape, findings) = shape_of(code);
        assert!(shape.control_flow_flattening);
        assert!(findings.contains("obfuscation.control_flow_flattening"));
    }

    #[test]
    fn test_clean_code_has_no_signals() {
        let code = "function add(left, right) {\n  return left + right;\n}\nconsole.log(add(1, 2));\n";
        let (shape, findings) = shape_of(code);
        assert_eq!(shape, ObfuscationShape::default());
        assert!(findings.is_empty());
    }

    #[test]
    fn test_minified_by_line_length() {
        let body = "a=a+1;".repeat(120);
        let code = format!("var a=0;{}", body);
        let (shape, findings) = shape_of(&code);
        assert!(shape.minified);
        assert!(findings.contains("obfuscation.minified"));
    }
}
