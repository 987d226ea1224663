//! Deobfuscation pipeline: staged AST rewrites over JavaScript-family source.
//!
//! Each component lives in its own submodule and the orchestrator in this
//! file drives them strictly in order.
//!
//! ## Architecture
//!
//! ```text
//! deobfuscate/
//! ├── mod.rs           - Orchestrator, result types
//! ├── parser.rs        - tree-sitter adapter, strict and relaxed parsing
//! ├── preprocess.rs    - Escape normalization, source-map stripping
//! ├── framework.rs     - Framework signature classifier
//! ├── printer.rs       - Generation and pretty-printing
//! ├── fold.rs          - Constant folding to a fixed point
//! ├── shape.rs         - Obfuscation signatures
//! ├── control_flow.rs  - Branch and jump inventory
//! ├── decode.rs        - String decoding cascade
//! ├── rules.rs         - Data-driven functionality rules
//! ├── scope.rs         - Binding resolution
//! ├── naming.rs        - Rename candidates and application
//! ├── annotate.rs      - Module and element-factory comments
//! └── cleanup.rs       - Cosmetic idiom rewrites
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use deobfuscate::{Deobfuscator, TransformOptions};
//!
//! let result = Deobfuscator::new(TransformOptions::default()).transform("1+2;");
//! assert_eq!(result.code, "3;\n");
//! ```

pub mod annotate;
pub mod cleanup;
pub mod common;
pub mod config;
pub mod control_flow;
pub mod decode;
pub mod error;
pub mod fold;
pub mod framework;
pub mod naming;
pub mod parser;
pub mod preprocess;
pub mod printer;
pub mod rules;
pub mod scope;
pub mod shape;

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use tracing::{debug, warn};

pub use common::{Finding, Location};
pub use config::TransformOptions;
pub use control_flow::BranchInfo;
pub use error::{DeobfuscateError, Result};
pub use naming::RenameEntry;
pub use parser::Dialect;
pub use rules::RuleSet;
pub use shape::ObfuscationShape;

use common::FindingSet;
use parser::{parse_strict, parse_tolerant, SourceUnit};

// ============ Result Types ============

/// A stage whose output was discarded, and why
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSkip {
    pub stage: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub folds: usize,
    pub fold_iterations: usize,
    pub decodes: usize,
    pub renames: usize,
    pub annotations: usize,
    pub cleanups: usize,
    pub escapes_normalized: usize,
    pub source_maps_removed: usize,
    /// Lines added or removed relative to the input
    pub changed_lines: usize,
}

/// Everything one `transform` call reports
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub code: String,
    pub findings: Vec<Finding>,
    pub renames: Vec<RenameEntry>,
    pub frameworks: Vec<String>,
    pub branches: Vec<BranchInfo>,
    pub jumps: Vec<String>,
    pub obfuscation: ObfuscationShape,
    pub stats: PipelineStats,
    pub skipped_stages: Vec<StageSkip>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineResult {
    fn fatal(original: &str, error: &DeobfuscateError, frameworks: Vec<String>, skipped_stages: Vec<StageSkip>) -> Self {
        Self {
            code: original.to_string(),
            frameworks,
            skipped_stages,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

// ============ Stage Isolation ============

#[derive(Default)]
struct StageRunner {
    skipped: Vec<StageSkip>,
}

impl StageRunner {
    /// Run one stage; errors and panics discard its output and are recorded
    fn run<T>(&mut self, stage: &'static str, f: impl FnOnce() -> Result<T>) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => {
                debug!(stage, "stage completed");
                Some(value)
            }
            Ok(Err(e)) => {
                warn!(stage, error = %e, "stage failed, keeping its input");
                self.skip(stage, e.to_string());
                None
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "stage panicked".to_string());
                warn!(stage, reason = %reason, "stage panicked, keeping its input");
                self.skip(stage, reason);
                None
            }
        }
    }

    fn skip(&mut self, stage: &'static str, reason: impl Into<String>) {
        self.skipped.push(StageSkip {
            stage: stage.to_string(),
            reason: reason.into(),
        });
    }

    /// Record a size-threshold skip without running the stage
    fn over_limit(&mut self, stage: &'static str, size: usize, limit: usize) -> bool {
        if size <= limit {
            return false;
        }
        debug!(stage, size, limit, "stage skipped by size threshold");
        self.skip(stage, format!("input of {} bytes exceeds limit of {} bytes", size, limit));
        true
    }
}

// ============ Orchestrator ============

/// Configured pipeline; cheap to share across threads
#[derive(Debug, Clone, Default)]
pub struct Deobfuscator {
    options: TransformOptions,
    rules: Option<RuleSet>,
}

impl Deobfuscator {
    pub fn new(options: TransformOptions) -> Self {
        Self { options, rules: None }
    }

    /// Replace the built-in rule table
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_options(mut self, options: TransformOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &TransformOptions {
        &self.options
    }

    /// Run every stage over `source`; never fails past this boundary
    pub fn transform(&self, source: &str) -> PipelineResult {
        let options = &self.options;
        let dialect = options.dialect;
        let mut runner = StageRunner::default();
        let mut stats = PipelineStats::default();

        let preprocessed = match runner.run("preprocess", || preprocess::preprocess(source, dialect)) {
            Some(pre) => {
                stats.escapes_normalized = pre.escapes_normalized;
                stats.source_maps_removed = pre.source_maps_removed;
                pre.text
            }
            None => source.to_string(),
        };

        // validate-parse: only a clean tree is worth re-laying out
        let clean_input = runner
            .run("validate", || {
                let tree = parser::parse_tree(&preprocessed, dialect)?;
                Ok(parser::count_syntax_errors(tree.root_node()).0 == 0)
            })
            .unwrap_or(false);

        let frameworks = runner
            .run("framework", || Ok(framework::classify(&preprocessed)))
            .unwrap_or_default();

        let mut normalized = preprocessed.clone();
        if clean_input && !runner.over_limit("normalize", preprocessed.len(), options.normalize_max_bytes) {
            if let Some(text) = runner.run("normalize", || {
                let unit = parse_strict(&preprocessed, dialect)?;
                Ok(printer::beautify_checked(&unit, "normalize")?.into_text())
            }) {
                normalized = text;
            }
        }

        let mut unit = match parse_strict(&normalized, dialect) {
            Ok(unit) => unit,
            Err(first) => {
                debug!(error = %first, "strict parse failed, retrying relaxed");
                match parse_tolerant(&preprocessed, dialect, options.max_parse_error_ratio) {
                    Ok(unit) => unit,
                    Err(e) => {
                        warn!(error = %e, "both parse attempts failed");
                        return PipelineResult::fatal(source, &e, frameworks, runner.skipped);
                    }
                }
            }
        };

        if options.fold_constants && !runner.over_limit("fold", unit.text().len(), options.fold_max_bytes) {
            if let Some(out) = runner.run("fold", || fold::fold_constants(&unit)) {
                stats.folds = out.folds;
                stats.fold_iterations = out.iterations;
                unit = out.unit;
            }
        }

        let mut findings = FindingSet::new();
        let obfuscation = runner
            .run("shape", || {
                let mut local = FindingSet::new();
                let shape = shape::detect_shape(&unit, source, &mut local);
                Ok((shape, local))
            })
            .map(|(shape, local)| {
                for finding in local.into_vec() {
                    findings.push(finding);
                }
                shape
            })
            .unwrap_or_default();

        let inventory = runner
            .run("control_flow", || Ok(control_flow::inventory(&unit)))
            .unwrap_or_default();

        if options.decode_strings && !runner.over_limit("decode", unit.text().len(), options.decode_max_bytes) {
            let fallback = options.replacement_fallback.as_deref();
            if let Some(out) = runner.run("decode", || decode::decode_strings(&unit, fallback)) {
                stats.decodes = out.candidates.len();
                unit = out.unit;
            }
        }

        let rules_findings = runner.run("rules", || {
            let rules = match &self.rules {
                Some(rules) => rules,
                None => RuleSet::builtin()?,
            };
            let mut local = FindingSet::new();
            rules.classify(&unit, &mut local);
            Ok(local)
        });
        for finding in rules_findings.map(FindingSet::into_vec).unwrap_or_default() {
            findings.push(finding);
        }

        let mut renames = Vec::new();
        if options.rename_identifiers {
            let scope_aware = options.scope_aware_renaming;
            if let Some(out) = runner.run("rename", || naming::rename_identifiers(&unit, &frameworks, scope_aware)) {
                stats.renames = out.entries.len();
                renames = out.entries;
                unit = out.unit;
            }
        }

        if options.framework_passes {
            if let Some(out) = runner.run("framework_passes", || Ok(annotate::annotate_elements(&unit, &frameworks))) {
                stats.annotations += out.annotations;
                unit = out.unit;
            }
        }

        if options.annotate_modules {
            if let Some(out) = runner.run("annotate", || Ok(annotate::annotate_modules(&unit))) {
                stats.annotations += out.annotations;
                unit = out.unit;
            }
        }

        if options.cosmetic_cleanups {
            if let Some(out) = runner.run("cleanup", || cleanup::cosmetic_cleanups(&unit)) {
                stats.cleanups = out.cleanups;
                unit = out.unit;
            }
        }

        let mut code = printer::generate(&unit);
        if options.pretty_print && !runner.over_limit("format", code.len(), options.format_max_bytes) {
            let formatted = runner.run("format", || printer::beautify_checked(&unit, "format"));
            if let Some(formatted) = formatted {
                code = formatted.into_text();
            }
        }

        stats.changed_lines = changed_lines(source, &code);
        debug!(
            folds = stats.folds,
            decodes = stats.decodes,
            renames = stats.renames,
            skipped = runner.skipped.len(),
            "transform finished"
        );

        PipelineResult {
            code,
            findings: findings.into_vec(),
            renames,
            frameworks,
            branches: inventory.branches,
            jumps: inventory.jumps,
            obfuscation,
            stats,
            skipped_stages: runner.skipped,
            error: None,
        }
    }
}

/// Transform with default options
pub fn transform(source: &str) -> PipelineResult {
    Deobfuscator::default().transform(source)
}

fn changed_lines(before: &str, after: &str) -> usize {
    TextDiff::from_lines(before, after)
        .iter_all_changes()
        .filter(|change| change.tag() != ChangeTag::Equal)
        .count()
}

/// Parse a unit the way the orchestrator does, for callers driving stages directly
pub fn parse_unit(text: &str, options: &TransformOptions) -> Result<SourceUnit> {
    parse_strict(text, options.dialect)
        .or_else(|_| parse_tolerant(text, options.dialect, options.max_parse_error_ratio))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> TransformOptions {
        TransformOptions::default()
    }

    #[test]
    fn test_fatal_parse_returns_original() {
        let source = ")))))))))";
        let result = transform(source);
        assert_eq!(result.code, source);
        assert!(result.error.is_some());
        assert!(!result.is_success());
        assert!(result.renames.is_empty());
    }

    #[test]
    fn test_disabled_stages_are_not_reported_as_skipped() {
        let opts = TransformOptions {
            fold_constants: false,
            decode_strings: false,
            rename_identifiers: false,
            pretty_print: false,
            ..options()
        };
        let result = Deobfuscator::new(opts).transform("var a = 1 + 2;");
        assert_eq!(result.code, "var a = 1 + 2;\n");
        assert!(result.skipped_stages.is_empty());
        assert!(result.renames.is_empty());
    }

    #[test]
    fn test_size_thresholds_skip_stages() {
        let opts = TransformOptions {
            fold_max_bytes: 4,
            format_max_bytes: 4,
            ..options()
        };
        let result = Deobfuscator::new(opts).transform("var x = 1 + 2;");
        let stages: Vec<_> = result.skipped_stages.iter().map(|s| s.stage.as_str()).collect();
        assert!(stages.contains(&"fold"));
        assert!(stages.contains(&"format"));
        assert!(result.code.contains("1 + 2"));
    }

    #[test]
    fn test_relaxed_parse_keeps_pipeline_running() {
        let result = transform("var value = 1 + 2;\nvar broken = (;\n");
        assert!(result.is_success());
        assert!(result.code.contains("var value = 3;"));
        // the formatter refuses trees with syntax errors
        assert!(result.skipped_stages.iter().any(|s| s.stage == "format"));
    }

    #[test]
    fn test_formatted_output_reparses_cleanly() {
        for source in ["a = b\n++c", "x = y\n(z)", "let s = `a${b}c`; if (a) b(); else { c() }", "return_ = a\n-1"] {
            let result = transform(source);
            assert!(
                !result.skipped_stages.iter().any(|s| s.stage == "format"),
                "{source}: {:?}",
                result.skipped_stages
            );
            assert!(parse_strict(&result.code, Dialect::JavaScript).is_ok(), "{}", result.code);
        }
    }

    #[test]
    fn test_stage_runner_absorbs_errors_and_panics() {
        let mut runner = StageRunner::default();
        let failed: Option<()> = runner.run("decode", || Err(DeobfuscateError::stage("decode", "bad")));
        assert!(failed.is_none());
        let panicked: Option<()> = runner.run("fold", || panic!("boom"));
        assert!(panicked.is_none());
        assert_eq!(runner.skipped.len(), 2);
        assert_eq!(runner.skipped[1].reason, "boom");
    }

    #[test]
    fn test_custom_rules_replace_builtin() {
        let rules = RuleSet::from_json(
            r#"[{"category": "billing", "description": "Payment SDK", "match": {"method": ["charge"]}}]"#,
        )
        .unwrap();
        let result = Deobfuscator::new(options())
            .with_rules(rules)
            .transform("stripe.charge(1);\nconsole.log(2);");
        let categories: Vec<_> = result.findings.iter().map(|f| f.category.as_str()).collect();
        assert_eq!(categories, vec!["billing"]);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let json = serde_json::to_value(transform("if (a) { b(); }")).unwrap();
        assert!(json.get("skippedStages").is_some());
        assert!(json["stats"].get("changedLines").is_some());
        assert!(json.get("error").is_none());
        assert_eq!(json["branches"][0]["kind"], "if");
    }
}
