//! Data-driven pattern/functionality classifier.
//!
//! Rules live in a JSON table; each category fires at most once per run.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tree_sitter::Node;

use crate::deobfuscate::common::{
    compact_whitespace, get_node_text, snippet, truncate_line, visit_nodes, Finding, FindingSet,
    Location, MAX_SNIPPET_LEN,
};
use crate::deobfuscate::error::{DeobfuscateError, Result};
use crate::deobfuscate::fold::string_literal_value;
use crate::deobfuscate::parser::SourceUnit;

const BUILTIN_RULES_JSON: &str = include_str!("../../rules/default_rules.json");

static BUILTIN_RULES: Lazy<Result<RuleSet>> = Lazy::new(|| RuleSet::from_json(BUILTIN_RULES_JSON));

// ============ Rule Table ============

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMatch {
    /// Full callee text of a call or `new` expression
    Callee(Vec<String>),
    /// Last member-property name of a callee
    Method(Vec<String>),
    /// Plain substring of the raw text
    Substring(Vec<String>),
    /// Regex over the raw text
    Regex(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub category: String,
    pub description: String,
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
}

#[derive(Debug, Clone)]
enum Matcher {
    Callee(HashSet<String>),
    Method(HashSet<String>),
    Substring(Vec<String>),
    Regex(Regex),
}

#[derive(Debug, Clone)]
struct Rule {
    category: String,
    description: String,
    matcher: Matcher,
}

/// Compiled rule table
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_json(json: &str) -> Result<Self> {
        let specs: Vec<RuleSpec> =
            serde_json::from_str(json).map_err(|e| DeobfuscateError::Rules(e.to_string()))?;
        Self::from_specs(specs)
    }

    pub fn from_specs(specs: Vec<RuleSpec>) -> Result<Self> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.category.trim().is_empty() {
                return Err(DeobfuscateError::Rules("rule with empty category".to_string()));
            }
            let matcher = match spec.matcher {
                RuleMatch::Callee(names) => Matcher::Callee(names.into_iter().collect()),
                RuleMatch::Method(names) => Matcher::Method(names.into_iter().collect()),
                RuleMatch::Substring(needles) => Matcher::Substring(needles),
                RuleMatch::Regex(pattern) => Matcher::Regex(Regex::new(&pattern).map_err(|e| {
                    DeobfuscateError::Rules(format!("category {}: {}", spec.category, e))
                })?),
            };
            rules.push(Rule {
                category: spec.category,
                description: spec.description,
                matcher,
            });
        }
        Ok(Self { rules })
    }

    /// Rule table compiled into the binary
    pub fn builtin() -> Result<&'static RuleSet> {
        BUILTIN_RULES.as_ref().map_err(Clone::clone)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn categories(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.rules
            .iter()
            .map(|r| r.category.as_str())
            .filter(|c| seen.insert(*c))
            .collect()
    }

    /// Run every rule against the unit, recording one finding per category
    pub fn classify(&self, unit: &SourceUnit, findings: &mut FindingSet) {
        let source = unit.source();

        visit_nodes(unit.root(), |node| {
            let callee = match node.kind() {
                "call_expression" => node.child_by_field_name("function"),
                "new_expression" => node.child_by_field_name("constructor"),
                _ => None,
            };
            if let Some(callee) = callee {
                self.match_call(node, callee, source, findings);
            }
            true
        });

        self.match_text(unit.text(), findings);
    }

    fn match_call(&self, call: Node, callee: Node, source: &[u8], findings: &mut FindingSet) {
        let callee_text = compact_whitespace(get_node_text(callee, source));
        let method = callee_method(callee, source);

        for rule in &self.rules {
            if findings.contains(&rule.category) {
                continue;
            }
            let hit = match &rule.matcher {
                Matcher::Callee(names) => names.contains(&callee_text),
                Matcher::Method(names) => method.as_ref().map_or(false, |m| names.contains(m)),
                _ => false,
            };
            if hit {
                findings.push(Finding {
                    category: rule.category.clone(),
                    description: rule.description.clone(),
                    snippet: snippet(call, source),
                    location: Location::of(call),
                });
            }
        }
    }

    fn match_text(&self, text: &str, findings: &mut FindingSet) {
        for rule in &self.rules {
            if findings.contains(&rule.category) {
                continue;
            }
            let found = match &rule.matcher {
                Matcher::Substring(needles) => needles
                    .iter()
                    .filter_map(|n| text.find(n.as_str()).map(|start| (start, start + n.len())))
                    .min(),
                Matcher::Regex(re) => re.find(text).map(|m| (m.start(), m.end())),
                _ => None,
            };
            if let Some((start, end)) = found {
                findings.push(Finding {
                    category: rule.category.clone(),
                    description: rule.description.clone(),
                    snippet: line_at(text, start),
                    location: Location::of_range(text, start, end),
                });
            }
        }
    }
}

fn callee_method(callee: Node, source: &[u8]) -> Option<String> {
    match callee.kind() {
        "member_expression" => callee
            .child_by_field_name("property")
            .map(|p| get_node_text(p, source).to_string()),
        "subscript_expression" => callee
            .child_by_field_name("index")
            .filter(|i| i.kind() == "string")
            .and_then(|i| string_literal_value(i, source)),
        _ => None,
    }
}

fn line_at(text: &str, offset: usize) -> String {
    let start = text[..offset].rfind('\n').map_or(0, |i| i + 1);
    let end = text[offset..].find('\n').map_or(text.len(), |i| offset + i);
    truncate_line(&compact_whitespace(&text[start..end]), MAX_SNIPPET_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deobfuscate::parser::{parse_strict, Dialect};

    fn classify(code: &str, rules: &RuleSet) -> Vec<Finding> {
        let unit = parse_strict(code, Dialect::JavaScript).unwrap();
        let mut findings = FindingSet::new();
        rules.classify(&unit, &mut findings);
        findings.into_vec()
    }

    #[test]
    fn test_builtin_rules_load() {
        let rules = RuleSet::builtin().unwrap();
        assert!(!rules.is_empty());
        let categories = rules.categories();
        for expected in ["logging", "network", "storage", "crypto", "dynamic_code", "wasm"] {
            assert!(categories.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_each_category_fires_once() {
        let rules = RuleSet::builtin().unwrap();
        let code = "console.log(1);\nconsole.warn(2);\nfetch('/api');\nnew WebSocket('ws://x');";
        let findings = classify(code, rules);
        let categories: Vec<_> = findings.iter().map(|f| f.category.as_str()).collect();
        assert_eq!(categories, vec!["logging", "network"]);
        assert_eq!(findings[0].snippet, "console.log(1)");
        assert_eq!(findings[0].location.start_line, 1);
    }

    #[test]
    fn test_method_and_text_rules() {
        let rules = RuleSet::builtin().unwrap();
        let code = "el.querySelector('#a');\nWebAssembly.instantiate(buf);\ndocument.cookie = 'a=1';";
        let categories: Vec<_> = classify(code, rules).into_iter().map(|f| f.category).collect();
        assert!(categories.contains(&"dom".to_string()));
        assert!(categories.contains(&"wasm".to_string()));
        assert!(categories.contains(&"storage".to_string()));
    }

    #[test]
    fn test_custom_rule_table() {
        let json = r#"[
            {"category": "billing", "description": "Payment SDK", "match": {"method": ["charge"]}},
            {"category": "secrets", "description": "Hardcoded key", "match": {"regex": "sk_live_[a-z0-9]+"}}
        ]"#;
        let rules = RuleSet::from_json(json).unwrap();
        let findings = classify("stripe.charge(1);\nvar k = 'sk_live_abc123';", &rules);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[1].location.start_line, 2);
    }

    #[test]
    fn test_invalid_rule_tables() {
        assert!(matches!(RuleSet::from_json("{"), Err(DeobfuscateError::Rules(_))));
        let bad_regex = r#"[{"category": "x", "description": "y", "match": {"regex": "("}}]"#;
        assert!(matches!(RuleSet::from_json(bad_regex), Err(DeobfuscateError::Rules(_))));
        let bad_kind = r#"[{"category": "x", "description": "y", "match": {"glob": "*"}}]"#;
        assert!(RuleSet::from_json(bad_kind).is_err());
    }
}
