//! Parser adapter: tree-sitter grammars behind a strict and a relaxed mode.

use serde::{Deserialize, Serialize};
use tracing::debug;
use tree_sitter::{Language, Node, Parser, Tree};

use crate::deobfuscate::common::{apply_edits, visit_nodes, Edit};
use crate::deobfuscate::error::{DeobfuscateError, Result};

// ============ Dialects ============

/// JavaScript-family grammars accepted by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Plain JavaScript, JSX included
    #[default]
    JavaScript,
    TypeScript,
    Tsx,
}

impl Dialect {
    /// Detect dialect from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "js" | "mjs" | "cjs" | "jsx" => Some(Self::JavaScript),
            "ts" | "mts" | "cts" => Some(Self::TypeScript),
            "tsx" => Some(Self::Tsx),
            _ => None,
        }
    }

    fn tree_sitter_language(&self) -> Language {
        match self {
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
        }
    }
}

// ============ Source Unit ============

/// Parsed source text owned by one pipeline invocation
#[derive(Debug, Clone)]
pub struct SourceUnit {
    text: String,
    tree: Tree,
    dialect: Dialect,
    syntax_errors: usize,
}

impl SourceUnit {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn source(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn syntax_errors(&self) -> usize {
        self.syntax_errors
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Apply edits and re-parse.
    ///
    /// The rewritten unit may not carry more syntax errors than this one.
    pub fn rewrite(&self, stage: &'static str, edits: &[Edit]) -> Result<SourceUnit> {
        if edits.is_empty() {
            return Ok(self.clone());
        }
        let text = apply_edits(&self.text, edits).map_err(|e| DeobfuscateError::stage(stage, e))?;
        self.reparse(stage, text)
    }

    /// Replace the whole text and re-parse under the same error budget
    pub fn reparse(&self, stage: &'static str, text: String) -> Result<SourceUnit> {
        let tree = parse_tree(&text, self.dialect)?;
        let (errors, _) = count_syntax_errors(tree.root_node());
        if errors > self.syntax_errors {
            return Err(DeobfuscateError::stage(
                stage,
                format!("rewrite introduced syntax errors ({} > {})", errors, self.syntax_errors),
            ));
        }
        Ok(SourceUnit {
            text,
            tree,
            dialect: self.dialect,
            syntax_errors: errors,
        })
    }
}

// ============ Parsing ============

/// Raw tree-sitter parse; never inspects the tree for errors
pub fn parse_tree(text: &str, dialect: Dialect) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&dialect.tree_sitter_language())
        .map_err(|e| DeobfuscateError::Language(e.to_string()))?;

    // Hostile input has crashed grammars before; keep the panic inside the adapter
    let parsed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| parser.parse(text, None)));
    match parsed {
        Ok(Some(tree)) => Ok(tree),
        Ok(None) => Err(DeobfuscateError::FatalParse {
            reason: "parser returned no tree".to_string(),
        }),
        Err(_) => Err(DeobfuscateError::FatalParse {
            reason: "parser panicked".to_string(),
        }),
    }
}

/// Parse and reject any tree containing ERROR or MISSING nodes
pub fn parse_strict(text: &str, dialect: Dialect) -> Result<SourceUnit> {
    let tree = parse_tree(text, dialect)?;
    let (errors, _) = count_syntax_errors(tree.root_node());
    if errors > 0 {
        let position = first_error_position(tree.root_node())
            .map(|(line, col)| format!(" at {}:{}", line, col))
            .unwrap_or_default();
        return Err(DeobfuscateError::FatalParse {
            reason: format!("{} syntax error(s){}", errors, position),
        });
    }
    Ok(SourceUnit {
        text: text.to_string(),
        tree,
        dialect,
        syntax_errors: 0,
    })
}

/// Parse accepting recoverable errors up to `max_error_ratio` of all nodes
pub fn parse_tolerant(text: &str, dialect: Dialect, max_error_ratio: f32) -> Result<SourceUnit> {
    let tree = parse_tree(text, dialect)?;
    let root = tree.root_node();
    if !text.trim().is_empty() && root.named_child_count() == 0 {
        return Err(DeobfuscateError::FatalParse {
            reason: "relaxed parse produced an empty tree".to_string(),
        });
    }
    let (errors, total) = count_syntax_errors(root);
    let ratio = if total == 0 { 0.0 } else { errors as f32 / total as f32 };
    debug!(errors, total, ratio, "relaxed parse");
    if ratio > max_error_ratio {
        return Err(DeobfuscateError::FatalParse {
            reason: format!(
                "error ratio {:.2} exceeds relaxed limit {:.2} ({} of {} nodes)",
                ratio, max_error_ratio, errors, total
            ),
        });
    }
    Ok(SourceUnit {
        text: text.to_string(),
        tree,
        dialect,
        syntax_errors: errors,
    })
}

/// Count ERROR/MISSING nodes and all named nodes
pub fn count_syntax_errors(root: Node) -> (usize, usize) {
    if !root.has_error() {
        let mut total = 0usize;
        visit_nodes(root, |node| {
            if node.is_named() {
                total += 1;
            }
            true
        });
        return (0, total);
    }
    let mut errors = 0usize;
    let mut total = 0usize;
    visit_nodes(root, |node| {
        if node.is_named() || node.is_missing() {
            total += 1;
        }
        if node.is_error() || node.is_missing() {
            errors += 1;
        }
        true
    });
    (errors, total)
}

fn first_error_position(root: Node) -> Option<(usize, usize)> {
    let mut found = None;
    visit_nodes(root, |node| {
        if found.is_some() {
            return false;
        }
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            found = Some((pos.row + 1, pos.column + 1));
            return false;
        }
        node.has_error()
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_detection() {
        assert_eq!(Dialect::from_extension("js"), Some(Dialect::JavaScript));
        assert_eq!(Dialect::from_extension("JSX"), Some(Dialect::JavaScript));
        assert_eq!(Dialect::from_extension("ts"), Some(Dialect::TypeScript));
        assert_eq!(Dialect::from_extension("tsx"), Some(Dialect::Tsx));
        assert_eq!(Dialect::from_extension("py"), None);
    }

    #[test]
    fn test_strict_parse_accepts_valid_code() {
        let unit = parse_strict("var a = 1;", Dialect::JavaScript).unwrap();
        assert_eq!(unit.syntax_errors(), 0);
        assert_eq!(unit.root().kind(), "program");
    }

    #[test]
    fn test_strict_parse_rejects_errors() {
        let err = parse_strict("var = ;;; {", Dialect::JavaScript).unwrap_err();
        assert!(matches!(err, DeobfuscateError::FatalParse { .. }));
    }

    #[test]
    fn test_tolerant_parse_accepts_small_errors() {
        let text = "var a = 1;\nvar b = 2;\nfunction f() { return a + b; }\nvar c = ;";
        let unit = parse_tolerant(text, Dialect::JavaScript, 0.25).unwrap();
        assert!(unit.syntax_errors() > 0);
    }

    #[test]
    fn test_tolerant_parse_rejects_garbage() {
        assert!(parse_tolerant(")))}}}{{{((( ]]][[[", Dialect::JavaScript, 0.25).is_err());
    }

    #[test]
    fn test_typescript_dialect() {
        let unit = parse_strict("let x: number = 1;", Dialect::TypeScript).unwrap();
        assert_eq!(unit.dialect(), Dialect::TypeScript);
        assert!(parse_strict("let x: number = 1;", Dialect::JavaScript).is_err());
    }

    #[test]
    fn test_rewrite_rejects_new_errors() {
        let unit = parse_strict("var a = 1;", Dialect::JavaScript).unwrap();
        let bad = vec![Edit { start: 8, end: 9, text: "".into() }];
        assert!(unit.rewrite("test", &bad).is_err());
        let good = vec![Edit { start: 8, end: 9, text: "2".into() }];
        assert_eq!(unit.rewrite("test", &good).unwrap().text(), "var a = 2;");
    }
}
