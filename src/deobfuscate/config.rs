//! Pipeline configuration.
//!
//! Size thresholds and feature toggles are passed into the pipeline explicitly;
//! nothing here is process-wide state.

use serde::{Deserialize, Serialize};

use crate::deobfuscate::error::{DeobfuscateError, Result};
use crate::deobfuscate::parser::Dialect;

// ============ Threshold Constants ============

pub const DEFAULT_NORMALIZE_MAX_BYTES: usize = 512 * 1024;
pub const DEFAULT_FOLD_MAX_BYTES: usize = 1024 * 1024;
pub const DEFAULT_DECODE_MAX_BYTES: usize = 1024 * 1024;
pub const DEFAULT_FORMAT_MAX_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_PARSE_ERROR_RATIO: f32 = 0.25;
pub const DEFAULT_REPLACEMENT_FALLBACK: &str = "center";

/// Options controlling a single `transform` invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransformOptions {
    pub dialect: Dialect,

    /// Inputs above this size skip the normalize/beautify round trip
    pub normalize_max_bytes: usize,
    /// Inputs above this size skip constant folding
    pub fold_max_bytes: usize,
    /// Inputs above this size skip the string decoding cascade
    pub decode_max_bytes: usize,
    /// Outputs above this size skip the final pretty-print
    pub format_max_bytes: usize,

    pub fold_constants: bool,
    pub decode_strings: bool,
    pub rename_identifiers: bool,
    pub annotate_modules: bool,
    pub framework_passes: bool,
    pub cosmetic_cleanups: bool,
    pub pretty_print: bool,

    /// Rename by binding identity instead of by bare name
    pub scope_aware_renaming: bool,

    /// Value substituted for strings made only of U+FFFD
    pub replacement_fallback: Option<String>,

    /// Highest ERROR/MISSING node ratio the relaxed parse accepts
    pub max_parse_error_ratio: f32,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::JavaScript,
            normalize_max_bytes: DEFAULT_NORMALIZE_MAX_BYTES,
            fold_max_bytes: DEFAULT_FOLD_MAX_BYTES,
            decode_max_bytes: DEFAULT_DECODE_MAX_BYTES,
            format_max_bytes: DEFAULT_FORMAT_MAX_BYTES,
            fold_constants: true,
            decode_strings: true,
            rename_identifiers: true,
            annotate_modules: true,
            framework_passes: true,
            cosmetic_cleanups: true,
            pretty_print: true,
            scope_aware_renaming: true,
            replacement_fallback: Some(DEFAULT_REPLACEMENT_FALLBACK.to_string()),
            max_parse_error_ratio: DEFAULT_MAX_PARSE_ERROR_RATIO,
        }
    }
}

impl TransformOptions {
    /// Parse options from a JSON document; missing keys keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| DeobfuscateError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.max_parse_error_ratio) {
            return Err(DeobfuscateError::Config(format!(
                "maxParseErrorRatio must be within 0..=1, got {}",
                self.max_parse_error_ratio
            )));
        }
        Ok(())
    }

    /// Apply `UNMINIFY_*` environment toggles on top of these options
    pub fn with_env_overrides(mut self) -> Self {
        if env_flag("UNMINIFY_NO_RENAME") {
            self.rename_identifiers = false;
        }
        if env_flag("UNMINIFY_NO_DECODE") {
            self.decode_strings = false;
        }
        if env_flag("UNMINIFY_NO_FORMAT") {
            self.pretty_print = false;
        }
        if env_flag("UNMINIFY_LEGACY_RENAME") {
            self.scope_aware_renaming = false;
        }
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
}

fn env_flag(name: &str) -> bool {
    let Ok(value) = std::env::var(name) else {
        return false;
    };
    is_truthy(&value)
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    matches!(value.as_str(), "1" | "true" | "yes" | "on")
}
