//! Cosmetic rewrites of common minifier idioms.

use tracing::debug;
use tree_sitter::Node;

use crate::deobfuscate::common::{get_node_text, is_identifier_name, is_reserved_word, visit_nodes, Edit};
use crate::deobfuscate::error::Result;
use crate::deobfuscate::fold::string_literal_value;
use crate::deobfuscate::parser::SourceUnit;
use crate::deobfuscate::scope::ScopeIndex;

const STAGE: &str = "cleanup";

#[derive(Debug)]
pub struct CleanupOutcome {
    pub unit: SourceUnit,
    pub cleanups: usize,
}

/// `!0` -> `true`, `!1` -> `false`, `void 0` -> `undefined`, `o["k"]` -> `o.k`
pub fn cosmetic_cleanups(unit: &SourceUnit) -> Result<CleanupOutcome> {
    let source = unit.source();
    let undefined_shadowed = ScopeIndex::analyze(unit.root(), source).is_declared("undefined");
    let mut edits = Vec::new();

    visit_nodes(unit.root(), |node| {
        match node.kind() {
            "unary_expression" => {
                if let Some(replacement) = unary_replacement(node, source, undefined_shadowed) {
                    edits.push(Edit::replace(node, replacement));
                    return false;
                }
            }
            "subscript_expression" => {
                if let Some(edit) = dot_access(node, source) {
                    edits.push(edit);
                }
            }
            _ => {}
        }
        true
    });

    debug!(cleanups = edits.len(), undefined_shadowed, "cosmetic cleanups collected");
    let cleanups = edits.len();
    let unit = unit.rewrite(STAGE, &edits)?;
    Ok(CleanupOutcome { unit, cleanups })
}

fn unary_replacement(node: Node, source: &[u8], undefined_shadowed: bool) -> Option<&'static str> {
    let operator = get_node_text(node.child_by_field_name("operator")?, source);
    let argument = node.child_by_field_name("argument")?;
    if argument.kind() != "number" {
        return None;
    }
    match (operator, get_node_text(argument, source)) {
        ("!", "0") => Some("true"),
        ("!", "1") => Some("false"),
        ("void", "0") if !undefined_shadowed => Some("undefined"),
        _ => None,
    }
}

/// Replace `["name"]` (or `?.["name"]`) with `.name` (or `?.name`)
fn dot_access(node: Node, source: &[u8]) -> Option<Edit> {
    let object = node.child_by_field_name("object")?;
    if object.kind() == "number" {
        return None;
    }
    let index = node.child_by_field_name("index")?;
    if index.kind() != "string" {
        return None;
    }
    let name = string_literal_value(index, source)?;
    if !is_identifier_name(&name) || is_reserved_word(&name) {
        return None;
    }

    let (start, accessor) = match node.child_by_field_name("optional_chain") {
        Some(chain) => (chain.start_byte(), format!("?.{}", name)),
        None => {
            let mut cursor = node.walk();
            let bracket = node.children(&mut cursor).find(|c| c.kind() == "[")?;
            (bracket.start_byte(), format!(".{}", name))
        }
    };
    Some(Edit {
        start,
        end: node.end_byte(),
        text: accessor,
    })
}
