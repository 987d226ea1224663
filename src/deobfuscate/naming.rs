//! Naming engine: candidate names for cryptic identifiers and their application.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;
use tree_sitter::Node;

use crate::deobfuscate::common::{get_node_text, is_reserved_word, named_children, visit_nodes, Edit};
use crate::deobfuscate::error::Result;
use crate::deobfuscate::parser::SourceUnit;
use crate::deobfuscate::scope::{BindingId, OccurrenceForm, ScopeIndex};

const STAGE: &str = "rename";

// ============ Dictionaries ============

const GENERIC_NAMES: &[(char, &str)] = &[
    ('a', "temp"),
    ('b', "value"),
    ('c', "context"),
    ('d', "data"),
    ('e', "element"),
    ('f', "callback"),
    ('g', "group"),
    ('h', "handler"),
    ('i', "index"),
    ('j', "innerIndex"),
    ('k', "key"),
    ('l', "list"),
    ('m', "map"),
    ('n', "count"),
    ('o', "options"),
    ('p', "params"),
    ('q', "queue"),
    ('r', "result"),
    ('s', "text"),
    ('t', "target"),
    ('u', "unit"),
    ('v', "item"),
    ('w', "wrapper"),
    ('x', "xValue"),
    ('y', "yValue"),
    ('z', "zValue"),
];

const TWO_LETTER_NAMES: &[(&str, &str)] = &[
    ("el", "element"),
    ("ev", "event"),
    ("cb", "callback"),
    ("fn", "func"),
    ("ex", "exception"),
    ("db", "database"),
    ("ms", "milliseconds"),
    ("ts", "timestamp"),
];

/// Two-letter names that already read as words
const MEANINGFUL_SHORT_NAMES: &[&str] = &[
    "id", "to", "of", "on", "up", "ok", "is", "go", "no", "me", "it", "at", "by", "fs", "os", "io",
    "ip", "ui",
];

const FRAMEWORK_NAMES: &[(&str, &[(char, &str)])] = &[
    ("react", &[('e', "props"), ('t', "ref"), ('n', "state"), ('r', "dispatch")]),
    ("jquery", &[('e', "event"), ('t', "element"), ('n', "selector")]),
    ("vue", &[('e', "vm"), ('t', "props"), ('n', "ctx")]),
    ("webpack", &[('e', "module"), ('t', "exports"), ('n', "require")]),
];

static STATE_HOOK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^use\w*State$").expect("state hook pattern is valid"));

// ============ Candidates ============

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameEntry {
    pub old_name: String,
    pub new_name: String,
    pub reason_tag: String,
}

fn generic_name(letter: char) -> Option<&'static str> {
    GENERIC_NAMES
        .iter()
        .find(|(c, _)| *c == letter)
        .map(|(_, name)| *name)
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Dictionary of the first detected framework that has one
fn framework_dictionary(frameworks: &[String]) -> Option<(&'static str, &'static [(char, &'static str)])> {
    frameworks.iter().find_map(|tag| {
        FRAMEWORK_NAMES
            .iter()
            .find(|(name, _)| *name == tag.as_str())
            .map(|(name, dict)| (*name, *dict))
    })
}

/// Suggested name and reason tag for a cryptic identifier
pub fn suggest_name(name: &str, frameworks: &[String]) -> Option<(String, String)> {
    let chars: Vec<char> = name.chars().collect();
    match chars.as_slice() {
        [c] if c.is_ascii_lowercase() => {
            if let Some((tag, dict)) = framework_dictionary(frameworks) {
                if let Some((_, mapped)) = dict.iter().find(|(l, _)| l == c) {
                    return Some((mapped.to_string(), format!("framework:{}", tag)));
                }
            }
            generic_name(*c).map(|n| (n.to_string(), "dictionary".to_string()))
        }
        [c] if c.is_ascii_uppercase() => generic_name(c.to_ascii_lowercase())
            .map(|n| (capitalize(n), "dictionary".to_string())),
        [a, b] if a.is_ascii_lowercase() && b.is_ascii_lowercase() => {
            if MEANINGFUL_SHORT_NAMES.contains(&name) {
                return None;
            }
            if let Some((_, mapped)) = TWO_LETTER_NAMES.iter().find(|(short, _)| *short == name) {
                return Some((mapped.to_string(), "dictionary".to_string()));
            }
            let base = generic_name(*a)?;
            Some((format!("{}{}", base, b.to_ascii_uppercase()), "dictionary".to_string()))
        }
        [a, d] if a.is_ascii_alphabetic() && d.is_ascii_digit() => {
            let base = generic_name(a.to_ascii_lowercase())?;
            let base = if a.is_ascii_uppercase() { capitalize(base) } else { base.to_string() };
            Some((format!("{}{}", base, d), "dictionary".to_string()))
        }
        _ => None,
    }
}

// ============ Allocation ============

/// Hands out fresh names; every new name belongs to exactly one old name
struct NameAllocator<'a> {
    existing: &'a HashSet<String>,
    owner: HashMap<String, String>,
}

impl<'a> NameAllocator<'a> {
    fn new(existing: &'a HashSet<String>) -> Self {
        Self {
            existing,
            owner: HashMap::new(),
        }
    }

    fn allocate(&mut self, desired: &str, old_name: &str) -> String {
        let mut candidate = desired.to_string();
        let mut suffix = 2usize;
        loop {
            match self.owner.get(&candidate) {
                Some(owner) if owner == old_name => return candidate,
                None if !self.existing.contains(&candidate) && !is_reserved_word(&candidate) => {
                    self.owner.insert(candidate.clone(), old_name.to_string());
                    return candidate;
                }
                _ => {}
            }
            candidate = format!("{}{}", desired, suffix);
            suffix += 1;
        }
    }
}

// ============ Planning ============

#[derive(Debug, Clone, Default)]
pub struct RenamePlan {
    pub entries: Vec<RenameEntry>,
    by_binding: HashMap<BindingId, String>,
    by_name: HashMap<String, String>,
}

impl RenamePlan {
    pub fn is_empty(&self) -> bool {
        self.by_binding.is_empty() && self.by_name.is_empty()
    }

    pub fn new_name_for(&self, binding: BindingId) -> Option<&str> {
        self.by_binding.get(&binding).map(String::as_str)
    }

    fn record(&mut self, seen: &mut HashSet<RenameEntry>, old_name: &str, new_name: &str, reason: &str) {
        let entry = RenameEntry {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            reason_tag: reason.to_string(),
        };
        if seen.insert(entry.clone()) {
            self.entries.push(entry);
        }
    }
}

/// `[x, setX] = useXxxState(...)` declarators, as (first, second) identifier nodes
fn state_hooks<'t>(root: Node<'t>, source: &[u8]) -> Vec<(Node<'t>, Node<'t>)> {
    let mut hooks = Vec::new();
    visit_nodes(root, |node| {
        if node.kind() != "variable_declarator" {
            return true;
        }
        let (Some(pattern), Some(value)) = (node.child_by_field_name("name"), node.child_by_field_name("value"))
        else {
            return true;
        };
        if pattern.kind() != "array_pattern" || value.kind() != "call_expression" {
            return true;
        }
        let elements = named_children(pattern);
        if elements.len() != 2 || elements.iter().any(|e| e.kind() != "identifier") {
            return true;
        }
        let hook_name = value.child_by_field_name("function").and_then(|callee| match callee.kind() {
            "identifier" => Some(get_node_text(callee, source)),
            "member_expression" => callee
                .child_by_field_name("property")
                .map(|p| get_node_text(p, source)),
            _ => None,
        });
        if hook_name.map_or(false, |name| STATE_HOOK.is_match(name)) {
            hooks.push((elements[0], elements[1]));
        }
        true
    });
    hooks
}

/// Decide new names for every renameable binding (or name, in legacy mode)
pub fn plan_renames(unit: &SourceUnit, index: &ScopeIndex, frameworks: &[String], scope_aware: bool) -> RenamePlan {
    let source = unit.source();
    let mut plan = RenamePlan::default();
    let mut seen = HashSet::new();
    let mut allocator = NameAllocator::new(index.all_names());

    for (first, second) in state_hooks(unit.root(), source) {
        let first_name = get_node_text(first, source);
        let second_name = get_node_text(second, source);
        let Some((base, _)) = suggest_name(first_name, frameworks) else {
            continue;
        };
        let pairs = [
            (first, first_name, format!("{}State", base)),
            (second, second_name, format!("set{}State", capitalize(&base))),
        ];
        for (node, old_name, desired) in pairs {
            let Some(binding) = index.binding_at(node.start_byte()) else {
                continue;
            };
            if index.bindings()[binding].exported {
                continue;
            }
            if scope_aware {
                if plan.by_binding.contains_key(&binding) {
                    continue;
                }
                let new_name = allocator.allocate(&desired, old_name);
                plan.by_binding.insert(binding, new_name.clone());
                plan.record(&mut seen, old_name, &new_name, "state-hook");
            } else if !plan.by_name.contains_key(old_name) {
                let new_name = allocator.allocate(&desired, old_name);
                plan.by_name.insert(old_name.to_string(), new_name.clone());
                plan.record(&mut seen, old_name, &new_name, "state-hook");
            }
        }
    }

    for (id, binding) in index.bindings().iter().enumerate() {
        if binding.exported {
            continue;
        }
        if scope_aware && plan.by_binding.contains_key(&id) {
            continue;
        }
        if !scope_aware && plan.by_name.contains_key(&binding.name) {
            continue;
        }
        let Some((desired, reason)) = suggest_name(&binding.name, frameworks) else {
            continue;
        };
        let new_name = allocator.allocate(&desired, &binding.name);
        if scope_aware {
            plan.by_binding.insert(id, new_name.clone());
        } else {
            plan.by_name.insert(binding.name.clone(), new_name.clone());
        }
        plan.record(&mut seen, &binding.name, &new_name, &reason);
    }

    debug!(renames = plan.entries.len(), scope_aware, "rename plan built");
    plan
}

// ============ Application ============

/// Rewrite every occurrence of a renamed binding
pub fn apply_renames(unit: &SourceUnit, index: &ScopeIndex, plan: &RenamePlan, scope_aware: bool) -> Result<SourceUnit> {
    let edits = if scope_aware {
        binding_edits(unit, index, plan)
    } else {
        name_edits(unit, plan)
    };
    unit.rewrite(STAGE, &edits)
}

fn binding_edits(unit: &SourceUnit, index: &ScopeIndex, plan: &RenamePlan) -> Vec<Edit> {
    let text = unit.text();
    index
        .occurrences()
        .iter()
        .filter_map(|occ| {
            let new_name = plan.new_name_for(occ.binding)?;
            let old_name = &text[occ.start..occ.end];
            let replacement = match occ.form {
                OccurrenceForm::Plain => new_name.to_string(),
                OccurrenceForm::ShorthandProperty | OccurrenceForm::ShorthandPattern => {
                    format!("{}: {}", old_name, new_name)
                }
                OccurrenceForm::ExportSpecifier => format!("{} as {}", new_name, old_name),
                OccurrenceForm::ImportSpecifier => format!("{} as {}", old_name, new_name),
            };
            Some(Edit {
                start: occ.start,
                end: occ.end,
                text: replacement,
            })
        })
        .collect()
}

/// Legacy global rewrite: every identifier-like node with a planned name
fn name_edits(unit: &SourceUnit, plan: &RenamePlan) -> Vec<Edit> {
    let source = unit.source();
    let mut edits = Vec::new();
    visit_nodes(unit.root(), |node| {
        if matches!(
            node.kind(),
            "identifier"
                | "property_identifier"
                | "shorthand_property_identifier"
                | "shorthand_property_identifier_pattern"
        ) {
            if let Some(new_name) = plan.by_name.get(get_node_text(node, source)) {
                edits.push(Edit::replace(node, new_name.clone()));
            }
        }
        true
    });
    edits
}

#[derive(Debug)]
pub struct RenameOutcome {
    pub unit: SourceUnit,
    pub entries: Vec<RenameEntry>,
}

/// Plan and apply renames in one step
pub fn rename_identifiers(unit: &SourceUnit, frameworks: &[String], scope_aware: bool) -> Result<RenameOutcome> {
    let index = ScopeIndex::analyze(unit.root(), unit.source());
    let plan = plan_renames(unit, &index, frameworks, scope_aware);
    if plan.is_empty() {
        return Ok(RenameOutcome {
            unit: unit.clone(),
            entries: Vec::new(),
        });
    }
    let renamed = apply_renames(unit, &index, &plan, scope_aware)?;
    Ok(RenameOutcome {
        unit: renamed,
        entries: plan.entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deobfuscate::parser::{parse_strict, Dialect};

    fn rename(code: &str, frameworks: &[&str], scope_aware: bool) -> RenameOutcome {
        let unit = parse_strict(code, Dialect::JavaScript).unwrap();
        let tags: Vec<String> = frameworks.iter().map(|s| s.to_string()).collect();
        rename_identifiers(&unit, &tags, scope_aware).unwrap()
    }

    #[test]
    fn test_suggest_name_shapes() {
        let none: Vec<String> = Vec::new();
        assert_eq!(suggest_name("a", &none), Some(("temp".into(), "dictionary".into())));
        assert_eq!(suggest_name("B", &none), Some(("Value".into(), "dictionary".into())));
        assert_eq!(suggest_name("el", &none), Some(("element".into(), "dictionary".into())));
        assert_eq!(suggest_name("ab", &none), Some(("tempB".into(), "dictionary".into())));
        assert_eq!(suggest_name("e2", &none), Some(("element2".into(), "dictionary".into())));
        assert_eq!(suggest_name("id", &none), None);
        assert_eq!(suggest_name("value", &none), None);
        assert_eq!(suggest_name("_", &none), None);
    }

    #[test]
    fn test_framework_dictionary_wins_in_classifier_order() {
        let tags = vec!["react".to_string(), "webpack".to_string()];
        assert_eq!(suggest_name("e", &tags), Some(("props".into(), "framework:react".into())));
        assert_eq!(suggest_name("a", &tags), Some(("temp".into(), "dictionary".into())));
        let tags = vec!["angular".to_string(), "vue".to_string()];
        assert_eq!(suggest_name("e", &tags), Some(("vm".into(), "framework:vue".into())));
    }

    #[test]
    fn test_default_dictionary_renames() {
        let out = rename("var a=1,b=2,c=a+b;", &[], true);
        assert_eq!(out.unit.text(), "var temp=1,value=2,context=temp+value;");
        let pairs: Vec<_> = out.entries.iter().map(|e| (e.old_name.as_str(), e.new_name.as_str())).collect();
        assert_eq!(pairs, vec![("a", "temp"), ("b", "value"), ("c", "context")]);
    }

    #[test]
    fn test_properties_and_globals_untouched() {
        let out = rename("function f(a) { return a.a + e.b; }", &[], true);
        assert_eq!(out.unit.text(), "function callback(temp) { return temp.a + e.b; }");
    }

    #[test]
    fn test_shorthand_and_module_specifiers_keep_meaning() {
        let out = rename("import {a} from 'm'; const b = {a}; const {c} = b; export {c};", &[], true);
        assert_eq!(
            out.unit.text(),
            "import {a as temp} from 'm'; const value = {a: temp}; const {c: context} = value; export {context as c};"
        );
    }

    #[test]
    fn test_new_names_avoid_existing_identifiers() {
        let out = rename("var a = temp.x; var temp2 = 1;", &[], true);
        assert_eq!(out.unit.text(), "var temp3 = temp.x; var temp2 = 1;");
    }

    #[test]
    fn test_state_hook_naming() {
        let out = rename("function C() { const [a, b] = React.useState(0); return b(a + 1); }", &["react"], true);
        assert_eq!(
            out.unit.text(),
            "function Context() { const [tempState, setTempState] = React.useState(0); return setTempState(tempState + 1); }"
        );
        assert!(out.entries.iter().all(|e| e.reason_tag == "state-hook" || e.old_name == "C"));
    }

    #[test]
    fn test_exported_bindings_keep_names() {
        let out = rename("export const a = 1; const b = a;", &[], true);
        assert_eq!(out.unit.text(), "export const a = 1; const value = a;");
    }

    #[test]
    fn test_legacy_mode_is_name_based() {
        let out = rename("var a = {a: 1}; a.a;", &[], false);
        assert_eq!(out.unit.text(), "var temp = {temp: 1}; temp.temp;");
    }

    #[test]
    fn test_clean_names_produce_no_renames() {
        let out = rename("function add(left, right) { return left + right; }", &[], true);
        assert!(out.entries.is_empty());
        assert_eq!(out.unit.text(), "function add(left, right) { return left + right; }");
    }
}
