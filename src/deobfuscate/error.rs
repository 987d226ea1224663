//! Typed pipeline errors.
//!
//! Only `FatalParse` ever reaches a caller of `transform`; every other variant
//! is absorbed at the stage boundary by the orchestrator.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeobfuscateError {
    /// Both the strict and the relaxed parse attempt failed
    #[error("failed to parse source: {reason}")]
    FatalParse { reason: String },

    /// A single pipeline stage failed; its output is discarded
    #[error("stage `{stage}` failed: {reason}")]
    Stage { stage: &'static str, reason: String },

    /// Tree-sitter language initialization failed
    #[error("failed to initialize tree-sitter language: {0}")]
    Language(String),

    /// Rule table could not be loaded or compiled
    #[error("invalid rule table: {0}")]
    Rules(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O failure in the file surface
    #[error("I/O error for {path}: {reason}")]
    Io { path: String, reason: String },
}

impl DeobfuscateError {
    pub fn stage(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeobfuscateError>;
