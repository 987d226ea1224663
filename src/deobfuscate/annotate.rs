//! Comment annotations for bundler chunks and framework element factories.
//!
//! Every edit here is a pure comment insertion anchored on a tree node, so
//! the annotated unit parses to the same tree modulo comments.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use tree_sitter::Node;

use crate::deobfuscate::common::{get_node_text, visit_nodes, Edit};
use crate::deobfuscate::fold::string_literal_value;
use crate::deobfuscate::parser::SourceUnit;

const STAGE: &str = "annotate";

const WRAPPER_ROLES: [&str; 3] = ["module", "exports", "require"];

static DISPLAY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\.displayName\s*=\s*["']([A-Za-z_$][\w$]*)["']"#).expect("displayName pattern is valid")
});

static EXPORT_DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b[\w$]+\.d\(\s*[\w$]+\s*,\s*\{\s*["']?([A-Za-z_$][\w$]*)["']?\s*:"#)
        .expect("export definition pattern is valid")
});

static PATH_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\.{1,2}/|/)?(?:[\w@.-]+/)+[\w.-]+$").expect("path pattern is valid")
});

static SCRIPT_EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\.(?:m?jsx?|cjs|tsx?|vue|svelte)$").expect("extension pattern is valid")
});

static ELEMENT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("element tag pattern is valid"));

struct ElementFactory {
    framework: &'static str,
    names: &'static [&'static str],
    tag_argument: usize,
}

const ELEMENT_FACTORIES: &[ElementFactory] = &[
    ElementFactory {
        framework: "react",
        names: &["createElement", "jsx", "jsxs", "_jsx", "_jsxs", "jsxDEV"],
        tag_argument: 0,
    },
    ElementFactory {
        framework: "vue",
        names: &["h", "_createElementVNode", "_createElementBlock", "createElementVNode"],
        tag_argument: 0,
    },
    ElementFactory {
        framework: "angular",
        names: &["ɵɵelementStart", "ɵɵelement"],
        tag_argument: 1,
    },
];

#[derive(Debug)]
pub struct AnnotationOutcome {
    pub unit: SourceUnit,
    pub annotations: usize,
}

// ============ Chunk Discovery ============

/// One `id: function (module, exports, require) {...}` entry of a chunk
struct ModuleWrapper<'t> {
    id: String,
    key: Node<'t>,
    params: Vec<Node<'t>>,
    body: Node<'t>,
}

fn non_comment_children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    let children = node
        .named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .collect();
    children
}

/// Module table of a `push([[ids], {...}])` call, if the call has that shape
fn chunk_table<'t>(call: Node<'t>, source: &[u8]) -> Option<Node<'t>> {
    let callee = call.child_by_field_name("function")?;
    if callee.kind() != "member_expression" {
        return None;
    }
    let property = callee.child_by_field_name("property")?;
    if get_node_text(property, source) != "push" {
        return None;
    }
    let args = non_comment_children(call.child_by_field_name("arguments")?);
    let outer = args.first().filter(|a| a.kind() == "array")?;
    let elements = non_comment_children(*outer);
    match elements.as_slice() {
        [ids, table, ..] if ids.kind() == "array" && table.kind() == "object" => Some(*table),
        _ => None,
    }
}

fn module_wrappers<'t>(root: Node<'t>, source: &[u8]) -> Vec<ModuleWrapper<'t>> {
    let mut wrappers = Vec::new();
    visit_nodes(root, |node| {
        if node.kind() != "call_expression" {
            return true;
        }
        let Some(table) = chunk_table(node, source) else {
            return true;
        };
        for pair in non_comment_children(table) {
            if pair.kind() != "pair" {
                continue;
            }
            let (Some(key), Some(value)) = (pair.child_by_field_name("key"), pair.child_by_field_name("value"))
            else {
                continue;
            };
            let id = match key.kind() {
                "number" | "property_identifier" => get_node_text(key, source).to_string(),
                "string" => match string_literal_value(key, source) {
                    Some(id) => id,
                    None => continue,
                },
                _ => continue,
            };
            if !matches!(value.kind(), "function_expression" | "function" | "arrow_function") {
                continue;
            }
            let Some(body) = value.child_by_field_name("body") else {
                continue;
            };
            let params = match (value.child_by_field_name("parameters"), value.child_by_field_name("parameter")) {
                (Some(list), _) => non_comment_children(list),
                (None, Some(single)) => vec![single],
                (None, None) => Vec::new(),
            };
            wrappers.push(ModuleWrapper { id, key, params, body });
        }
        true
    });
    wrappers
}

// ============ Module Names ============

fn sanitize_identifier(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '$' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        return Some(format!("_{}", cleaned));
    }
    Some(cleaned)
}

/// `./components/Button.jsx` -> `Button`, `./header/index.js` -> `header`
fn name_from_path(path: &str) -> Option<String> {
    if !PATH_LIKE.is_match(path) || !(path.starts_with('.') || SCRIPT_EXTENSION.is_match(path)) {
        return None;
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty() && *s != "." && *s != "..").collect();
    let (last, parents) = segments.split_last()?;
    let stem = last.split('.').next().unwrap_or(last);
    let stem = if stem == "index" { parents.last().copied()? } else { stem };
    sanitize_identifier(stem)
}

fn infer_module_name(body: Node, source: &[u8]) -> Option<String> {
    let mut from_path = None;
    visit_nodes(body, |node| {
        if from_path.is_some() {
            return false;
        }
        if node.kind() == "string" {
            from_path = string_literal_value(node, source).and_then(|value| name_from_path(&value));
            return false;
        }
        true
    });
    if from_path.is_some() {
        return from_path;
    }

    let text = get_node_text(body, source);
    DISPLAY_NAME
        .captures(text)
        .or_else(|| EXPORT_DEFINITION.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn module_names(wrappers: &[ModuleWrapper], source: &[u8]) -> HashMap<String, String> {
    wrappers
        .iter()
        .map(|w| {
            let name = infer_module_name(w.body, source).unwrap_or_else(|| format!("module_{}", w.id));
            (w.id.clone(), name)
        })
        .collect()
}

// ============ Sub-passes ============

/// Insert `comment` after `node` unless the text already carries it there
fn comment_after(node: Node, text: &str, comment: String, edits: &mut Vec<Edit>) {
    let at = node.end_byte();
    if text[at..].starts_with(&comment) {
        return;
    }
    edits.push(Edit::insert(at, comment));
}

fn module_key_edits(unit: &SourceUnit, names: &HashMap<String, String>) -> Vec<Edit> {
    let mut edits = Vec::new();
    for wrapper in module_wrappers(unit.root(), unit.source()) {
        if let Some(name) = names.get(&wrapper.id) {
            comment_after(wrapper.key, unit.text(), format!(" /* module: {} */", name), &mut edits);
        }
    }
    edits
}

fn wrapper_param_edits(unit: &SourceUnit) -> Vec<Edit> {
    let mut edits = Vec::new();
    for wrapper in module_wrappers(unit.root(), unit.source()) {
        for (param, role) in wrapper.params.iter().zip(WRAPPER_ROLES) {
            if param.kind() == "identifier" {
                comment_after(*param, unit.text(), format!(" /* {} */", role), &mut edits);
            }
        }
    }
    edits
}

fn require_call_edits(unit: &SourceUnit, names: &HashMap<String, String>) -> Vec<Edit> {
    let source = unit.source();
    let mut edits = Vec::new();
    for wrapper in module_wrappers(unit.root(), source) {
        let Some(require) = wrapper.params.get(2).filter(|p| p.kind() == "identifier") else {
            continue;
        };
        let require_name = get_node_text(*require, source);
        visit_nodes(wrapper.body, |node| {
            if node.kind() != "call_expression" {
                return true;
            }
            let callee_matches = node
                .child_by_field_name("function")
                .map_or(false, |f| f.kind() == "identifier" && get_node_text(f, source) == require_name);
            if !callee_matches {
                return true;
            }
            let args = node
                .child_by_field_name("arguments")
                .map(non_comment_children)
                .unwrap_or_default();
            if let [arg] = args.as_slice() {
                if arg.kind() == "number" {
                    if let Some(name) = names.get(get_node_text(*arg, source)) {
                        comment_after(*arg, unit.text(), format!(" /* {} */", name), &mut edits);
                    }
                }
            }
            true
        });
    }
    edits
}

/// Called name of a factory call: `f(...)`, `a.f(...)` or `(0, a.f)(...)`
fn factory_name<'s>(callee: Node, source: &'s [u8]) -> Option<&'s str> {
    match callee.kind() {
        "identifier" => Some(get_node_text(callee, source)),
        "member_expression" => callee.child_by_field_name("property").map(|p| get_node_text(p, source)),
        "parenthesized_expression" | "sequence_expression" => {
            let last = non_comment_children(callee).pop()?;
            factory_name(last, source)
        }
        _ => None,
    }
}

fn element_factory_edits(unit: &SourceUnit, frameworks: &[String]) -> Vec<Edit> {
    let factories: Vec<&ElementFactory> = ELEMENT_FACTORIES
        .iter()
        .filter(|f| frameworks.iter().any(|tag| tag == f.framework))
        .collect();
    if factories.is_empty() {
        return Vec::new();
    }

    let source = unit.source();
    let mut edits = Vec::new();
    visit_nodes(unit.root(), |node| {
        if node.kind() != "call_expression" {
            return true;
        }
        let Some(name) = node.child_by_field_name("function").and_then(|f| factory_name(f, source)) else {
            return true;
        };
        let Some(factory) = factories.iter().find(|f| f.names.contains(&name)) else {
            return true;
        };
        let args = node
            .child_by_field_name("arguments")
            .map(non_comment_children)
            .unwrap_or_default();
        if let Some(tag_node) = args.get(factory.tag_argument).filter(|a| a.kind() == "string") {
            if let Some(tag) = string_literal_value(*tag_node, source).filter(|t| ELEMENT_TAG.is_match(t)) {
                comment_after(*tag_node, unit.text(), format!(" /* <{}> */", tag), &mut edits);
            }
        }
        true
    });
    edits
}

// ============ Entry Points ============

type SubPass<'a> = (&'static str, Box<dyn Fn(&SourceUnit) -> Vec<Edit> + 'a>);

fn sub_pass<'a>(name: &'static str, pass: impl Fn(&SourceUnit) -> Vec<Edit> + 'a) -> SubPass<'a> {
    (name, Box::new(pass))
}

/// Apply sub-passes in order; a failing one is dropped on its own
fn run_sub_passes(unit: &SourceUnit, passes: Vec<SubPass<'_>>) -> AnnotationOutcome {
    let mut current = unit.clone();
    let mut annotations = 0usize;
    for (name, pass) in passes {
        let edits = pass(&current);
        if edits.is_empty() {
            continue;
        }
        match current.rewrite(STAGE, &edits) {
            Ok(next) => {
                debug!(sub_pass = name, count = edits.len(), "annotations inserted");
                annotations += edits.len();
                current = next;
            }
            Err(e) => warn!(sub_pass = name, error = %e, "annotation sub-pass skipped"),
        }
    }
    AnnotationOutcome {
        unit: current,
        annotations,
    }
}

/// Label bundler chunk modules, their wrapper parameters and numeric requires
pub fn annotate_modules(unit: &SourceUnit) -> AnnotationOutcome {
    let names = module_names(&module_wrappers(unit.root(), unit.source()), unit.source());
    if names.is_empty() {
        return AnnotationOutcome {
            unit: unit.clone(),
            annotations: 0,
        };
    }
    let names = &names;
    run_sub_passes(
        unit,
        vec![
            sub_pass("module-keys", move |u: &SourceUnit| module_key_edits(u, names)),
            sub_pass("wrapper-params", wrapper_param_edits),
            sub_pass("require-calls", move |u: &SourceUnit| require_call_edits(u, names)),
        ],
    )
}

/// Label element-factory calls of the detected frameworks with their tag
pub fn annotate_elements(unit: &SourceUnit, frameworks: &[String]) -> AnnotationOutcome {
    run_sub_passes(
        unit,
        vec![sub_pass("element-factories", move |u: &SourceUnit| {
            element_factory_edits(u, frameworks)
        })],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deobfuscate::parser::{parse_strict, Dialect};

    fn unit(code: &str) -> SourceUnit {
        parse_strict(code, Dialect::JavaScript).unwrap()
    }

    #[test]
    fn test_chunk_wrappers_are_labeled() {
        let code = "(self.chunks = self.chunks || []).push([[7], {12345: (a, b, c) => { c(678); }, 678: function (a, b) { a.exports = 1; }}]);";
        let out = annotate_modules(&unit(code));
        assert_eq!(
            out.unit.text(),
            "(self.chunks = self.chunks || []).push([[7], {12345 /* module: module_12345 */: (a /* module */, b /* exports */, c /* require */) => { c(678 /* module_678 */); }, 678 /* module: module_678 */: function (a /* module */, b /* exports */) { a.exports = 1; }}]);"
        );
        assert_eq!(out.annotations, 8);
        assert_eq!(out.unit.syntax_errors(), 0);
    }

    #[test]
    fn test_module_name_inference() {
        let code = r#"w.push([[1], {
  1: function (e, t, n) { var s = "./src/components/Button.jsx"; },
  2: function (e, t, n) { Card.displayName = "Card"; },
  3: function (e, t, n) { n.d(t, { Modal: () => r }); },
  4: function (e, t, n) { var s = "./lib/header/index.js"; }
}]);"#;
        let out = annotate_modules(&unit(code));
        let text = out.unit.text();
        assert!(text.contains("1 /* module: Button */:"));
        assert!(text.contains("2 /* module: Card */:"));
        assert!(text.contains("3 /* module: Modal */:"));
        assert!(text.contains("4 /* module: header */:"));
    }

    #[test]
    fn test_annotation_is_idempotent() {
        let code = "w.push([[1], {5: (a, b, c) => { c(5); }}]);";
        let once = annotate_modules(&unit(code));
        let twice = annotate_modules(&once.unit);
        assert_eq!(twice.annotations, 0);
        assert_eq!(twice.unit.text(), once.unit.text());
    }

    #[test]
    fn test_non_chunk_push_untouched() {
        let out = annotate_modules(&unit("list.push([1, 2], {a: 1});\nitems.push([[1], 2]);"));
        assert_eq!(out.annotations, 0);
    }

    #[test]
    fn test_element_factories_by_framework() {
        let code = "React.createElement(\"div\", null); (0, r.jsx)(\"span\", {}); h(\"p\"); createElement(Comp, null);";
        let react = vec!["react".to_string()];
        let out = annotate_elements(&unit(code), &react);
        assert_eq!(
            out.unit.text(),
            "React.createElement(\"div\" /* <div> */, null); (0, r.jsx)(\"span\" /* <span> */, {}); h(\"p\"); createElement(Comp, null);"
        );

        let none: Vec<String> = Vec::new();
        assert_eq!(annotate_elements(&unit(code), &none).annotations, 0);
    }

    #[test]
    fn test_angular_tag_argument_position() {
        let angular = vec!["angular".to_string()];
        let out = annotate_elements(&unit("i0.ɵɵelementStart(0, \"button\", 1);"), &angular);
        assert_eq!(out.unit.text(), "i0.ɵɵelementStart(0, \"button\" /* <button> */, 1);");
    }

    #[test]
    fn test_path_names() {
        assert_eq!(name_from_path("./a/my-widget.tsx").as_deref(), Some("my_widget"));
        assert_eq!(name_from_path("https://example.com/x.js"), None);
        assert_eq!(name_from_path("plain words"), None);
        assert_eq!(name_from_path("/api/users"), None);
    }
}
