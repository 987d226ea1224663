//! String decoding cascade.
//!
//! Each string literal runs through a fixed sequence of heuristic decoders;
//! the first accepted candidate replaces the literal's value. A candidate is
//! accepted only after passing an explicit plausibility filter, so the output
//! is either the original value or something that looks like text.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;
use tree_sitter::Node;

use crate::deobfuscate::common::{get_node_text, visit_nodes, Edit};
use crate::deobfuscate::error::Result;
use crate::deobfuscate::fold::{quote_string, string_literal_value};
use crate::deobfuscate::parser::SourceUnit;

// ============ Constants ============

const STAGE: &str = "decode";
const REPLACEMENT: char = '\u{FFFD}';
const MIN_DECODE_LEN: usize = 3;
const CLEAN_ALPHA_RATIO: f32 = 0.7;
const XOR_KEYS: &[u8] = &[0x1, 0x7, 0xF, 0xFF, 0x33, 0x42, 0x5A];
/// Brute-force candidates need this many letter pairs to be scored at all
const MIN_LETTER_PAIRS: usize = 4;
/// Inputs scoring at least this are already text and never brute-forced;
/// accepted brute-force candidates must reach it
const ENGLISH_SCORE: f32 = 0.4;
/// Required gain of a brute-force candidate over its input
const SCORE_MARGIN: f32 = 0.25;

/// Frequent English letter pairs used to rank brute-force candidates
const COMMON_BIGRAMS: &[&str] = &[
    "th", "he", "in", "er", "an", "re", "on", "at", "en", "nd", "ti", "es", "or", "te", "of",
    "ed", "is", "it", "al", "ar", "st", "to", "nt", "ng", "se", "ha", "as", "ou", "io", "le",
    "ve", "co", "me", "de", "hi", "ri", "ro", "ic", "ne", "ea", "ra", "ce",
];

/// windows-1252 code points for bytes 0x80..=0x9F; `None` marks undefined bytes
const WINDOWS_1252_HIGH: [Option<char>; 32] = [
    Some('€'), None, Some('‚'), Some('ƒ'), Some('„'), Some('…'), Some('†'), Some('‡'),
    Some('ˆ'), Some('‰'), Some('Š'), Some('‹'), Some('Œ'), None, Some('Ž'), None,
    None, Some('‘'), Some('’'), Some('“'), Some('”'), Some('•'), Some('–'), Some('—'),
    Some('˜'), Some('™'), Some('š'), Some('›'), Some('œ'), None, Some('ž'), Some('Ÿ'),
];

static CLEAN_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^[A-Za-z0-9\s.,;:!?'"()\[\]{}<>\-/_@#&%$*|~`]+$"#).expect("clean text pattern is valid")
});
static ROT13_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]+(?:[\^_/'][a-z]+)+$").expect("rot13 shape pattern is valid"));
static BASE64_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/]+={1,2}$").expect("base64 shape pattern is valid"));
static HEX_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]+$").expect("hex shape pattern is valid"));
static ALPHA_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]+$").expect("alpha shape pattern is valid"));
static APOSTROPHE_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]+(?:'[A-Za-z]+)+$").expect("apostrophe shape pattern is valid"));
static ALPHA_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z ]+$").expect("alpha spaces pattern is valid"));
static UNICODE_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\u([0-9a-fA-F]{4})").expect("unicode escape pattern is valid"));
static CHAR_CODES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}(?:\s*,\s*\d{1,3})+$").expect("char code pattern is valid"));
static PRINTABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\x20-\x7E\t\r\n]+$").expect("printable pattern is valid"));

// ============ Candidates ============

/// How a candidate value was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DecodeMethod {
    Reencode(&'static str),
    Fallback,
    Rot13,
    Base64,
    Hex,
    Custom,
    UnicodeEscape,
    CharCodes,
    Xor(u8),
    Caesar(u8),
    /// No decoder applied; the original value is kept
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeCandidate {
    pub original: String,
    pub decoded: String,
    pub method: DecodeMethod,
    pub accepted: bool,
}

impl DecodeCandidate {
    fn accept(original: &str, decoded: String, method: DecodeMethod) -> Self {
        Self {
            original: original.to_string(),
            decoded,
            method,
            accepted: true,
        }
    }

    fn keep(original: &str) -> Self {
        Self {
            original: original.to_string(),
            decoded: original.to_string(),
            method: DecodeMethod::Unchanged,
            accepted: false,
        }
    }
}

/// Run the cascade over one string value
pub fn decode_value(value: &str, fallback: Option<&str>) -> DecodeCandidate {
    // Replacement-character repair comes first: damaged strings are often short
    if value.contains(REPLACEMENT) {
        return repair_replacement(value, fallback);
    }
    if value.chars().count() < MIN_DECODE_LEN || looks_clean(value) {
        return DecodeCandidate::keep(value);
    }
    if ROT13_SHAPE.is_match(value) {
        // rot13 is its own inverse: only the direction that reads better is taken
        let rotated = rot13(value);
        return if bigram_score(&rotated) > bigram_score(value) {
            DecodeCandidate::accept(value, rotated, DecodeMethod::Rot13)
        } else {
            DecodeCandidate::keep(value)
        };
    }
    if let Some(candidate) = decode_by_charset(value) {
        return candidate;
    }
    decode_brute_force(value).unwrap_or_else(|| DecodeCandidate::keep(value))
}

fn looks_clean(value: &str) -> bool {
    let total = value.chars().count().max(1);
    let alpha = value.chars().filter(|c| c.is_alphabetic()).count();
    alpha as f32 / total as f32 > CLEAN_ALPHA_RATIO && CLEAN_TEXT.is_match(value)
}

/// Printable ASCII with at least one alphanumeric character
fn is_plausible(text: &str) -> bool {
    PRINTABLE.is_match(text) && text.chars().any(|c| c.is_ascii_alphanumeric())
}

// ============ Replacement Repair ============

fn repair_replacement(value: &str, fallback: Option<&str>) -> DecodeCandidate {
    let mut bytes = Vec::new();
    let mut has_wide = false;
    for c in value.chars().filter(|&c| c != REPLACEMENT) {
        if (c as u32) <= 0xFF {
            bytes.push(c as u32 as u8);
        } else {
            has_wide = true;
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }

    if bytes.is_empty() {
        return match fallback {
            Some(text) => DecodeCandidate::accept(value, text.to_string(), DecodeMethod::Fallback),
            None => DecodeCandidate::keep(value),
        };
    }

    let decoders: [(&'static str, fn(&[u8]) -> Option<String>, bool); 5] = [
        ("latin1", decode_latin1, true),
        ("utf8", decode_utf8, false),
        ("ascii", decode_ascii, true),
        ("utf-16le", decode_utf16le, false),
        ("windows-1252", decode_windows_1252, true),
    ];
    for (name, decoder, single_byte) in decoders {
        // Single-byte decoders would turn multi-byte characters into mojibake
        if single_byte && has_wide {
            continue;
        }
        if let Some(text) = decoder(&bytes) {
            if !text.is_empty() && !text.contains(REPLACEMENT) {
                return DecodeCandidate::accept(value, text, DecodeMethod::Reencode(name));
            }
        }
    }
    DecodeCandidate::keep(value)
}

fn decode_latin1(bytes: &[u8]) -> Option<String> {
    Some(bytes.iter().map(|&b| b as char).collect())
}

fn decode_utf8(bytes: &[u8]) -> Option<String> {
    String::from_utf8(bytes.to_vec()).ok()
}

fn decode_ascii(bytes: &[u8]) -> Option<String> {
    bytes.is_ascii().then(|| bytes.iter().map(|&b| b as char).collect())
}

fn decode_utf16le(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units = bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units).collect::<std::result::Result<String, _>>().ok()
}

fn decode_windows_1252(bytes: &[u8]) -> Option<String> {
    bytes
        .iter()
        .map(|&b| match b {
            0x80..=0x9F => WINDOWS_1252_HIGH[(b - 0x80) as usize],
            _ => Some(b as char),
        })
        .collect()
}

// ============ Charset Decoders ============

fn decode_by_charset(value: &str) -> Option<DecodeCandidate> {
    let len = value.len();
    if BASE64_SHAPE.is_match(value) && len >= 4 && len % 4 == 0 {
        let decoded = BASE64.decode(value).ok().and_then(|b| String::from_utf8(b).ok());
        return Some(match decoded {
            Some(text) if is_plausible(&text) => DecodeCandidate::accept(value, text, DecodeMethod::Base64),
            _ => DecodeCandidate::keep(value),
        });
    }
    if HEX_SHAPE.is_match(value) && len >= 4 && len % 2 == 0 {
        return Some(match decode_hex(value) {
            Some(text) if is_plausible(&text) => DecodeCandidate::accept(value, text, DecodeMethod::Hex),
            _ => DecodeCandidate::keep(value),
        });
    }
    if ALPHA_SHAPE.is_match(value) {
        let rotated = rot13(value);
        return Some(if ALPHA_SPACES.is_match(&rotated) && rotated.len() >= MIN_DECODE_LEN {
            DecodeCandidate::accept(value, rotated, DecodeMethod::Rot13)
        } else {
            DecodeCandidate::keep(value)
        });
    }
    if APOSTROPHE_SHAPE.is_match(value) {
        let decoded = decode_custom(value);
        return Some(
            if ALPHA_SPACES.is_match(&decoded) && bigram_score(&decoded) > bigram_score(value) {
                DecodeCandidate::accept(value, decoded, DecodeMethod::Custom)
            } else {
                DecodeCandidate::keep(value)
            },
        );
    }
    None
}

fn decode_hex(value: &str) -> Option<String> {
    let bytes = (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Apostrophe-separated segments, each rotated, joined as words
fn decode_custom(value: &str) -> String {
    value.split('\'').map(rot13).collect::<Vec<_>>().join(" ")
}

fn rot13(value: &str) -> String {
    caesar(value, 13)
}

fn caesar(value: &str, shift: u8) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a' + shift) % 26) + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A' + shift) % 26) + b'A') as char,
            _ => c,
        })
        .collect()
}

// ============ Brute-Force Decoders ============

fn decode_brute_force(value: &str) -> Option<DecodeCandidate> {
    if UNICODE_ESCAPE.is_match(value) {
        let expanded = UNICODE_ESCAPE.replace_all(value, |caps: &regex::Captures| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        });
        if expanded != value && is_plausible(&expanded) {
            return Some(DecodeCandidate::accept(value, expanded.into_owned(), DecodeMethod::UnicodeEscape));
        }
    }

    if CHAR_CODES.is_match(value) {
        let decoded: Option<String> = value
            .split(',')
            .map(|code| code.trim().parse::<u32>().ok().and_then(char::from_u32))
            .collect();
        if let Some(text) = decoded.filter(|t| is_plausible(t)) {
            return Some(DecodeCandidate::accept(value, text, DecodeMethod::CharCodes));
        }
    }

    let (baseline, _) = bigram_stats(value);
    if baseline >= ENGLISH_SCORE {
        return None;
    }

    let mut best: Option<(f32, String, DecodeMethod)> = None;
    let mut consider = |text: String, method: DecodeMethod| {
        if !is_plausible(&text) {
            return;
        }
        let (score, pairs) = bigram_stats(&text);
        if pairs < MIN_LETTER_PAIRS || score < ENGLISH_SCORE || score < baseline + SCORE_MARGIN {
            return;
        }
        if best.as_ref().map_or(true, |(top, _, _)| score > *top) {
            best = Some((score, text, method));
        }
    };

    if value.chars().all(|c| (c as u32) <= 0xFF) {
        let bytes: Vec<u8> = value.chars().map(|c| c as u32 as u8).collect();
        for &key in XOR_KEYS {
            consider(bytes.iter().map(|&b| (b ^ key) as char).collect(), DecodeMethod::Xor(key));
        }
    }
    for shift in 1..26u8 {
        consider(caesar(value, shift), DecodeMethod::Caesar(shift));
    }

    best.map(|(_, text, method)| DecodeCandidate::accept(value, text, method))
}

/// Share of adjacent letter pairs that are common English bigrams
pub fn bigram_score(text: &str) -> f32 {
    bigram_stats(text).0
}

/// Bigram score plus the number of letter pairs it was computed over
fn bigram_stats(text: &str) -> (f32, usize) {
    let lower: Vec<char> = text.to_lowercase().chars().collect();
    let mut hits = 0usize;
    let mut pairs = 0usize;
    for pair in lower.windows(2) {
        if !(pair[0].is_ascii_alphabetic() && pair[1].is_ascii_alphabetic()) {
            continue;
        }
        pairs += 1;
        let bigram: String = pair.iter().collect();
        if COMMON_BIGRAMS.contains(&bigram.as_str()) {
            hits += 1;
        }
    }
    if pairs == 0 {
        (0.0, 0)
    } else {
        (hits as f32 / pairs as f32, pairs)
    }
}

// ============ Decoding Pass ============

#[derive(Debug)]
pub struct DecodeOutcome {
    pub unit: SourceUnit,
    /// Accepted candidates, in source order
    pub candidates: Vec<DecodeCandidate>,
}

/// Decode every eligible string literal in the unit
pub fn decode_strings(unit: &SourceUnit, fallback: Option<&str>) -> Result<DecodeOutcome> {
    let source = unit.source();
    let mut edits = Vec::new();
    let mut candidates = Vec::new();

    visit_nodes(unit.root(), |node| {
        if node.kind() != "string" {
            return true;
        }
        if is_module_specifier(node, source) || node.parent().map_or(false, |p| p.kind() == "jsx_attribute") {
            return false;
        }
        let Some(value) = string_literal_value(node, source) else {
            return false;
        };
        let candidate = decode_value(&value, fallback);
        if candidate.accepted && candidate.decoded != value {
            let quote = get_node_text(node, source).chars().next().unwrap_or('"');
            debug!(method = ?candidate.method, original = %candidate.original, "decoded string literal");
            edits.push(Edit::replace(node, quote_string(&candidate.decoded, quote)));
            candidates.push(candidate);
        }
        false
    });

    let unit = unit.rewrite(STAGE, &edits)?;
    Ok(DecodeOutcome { unit, candidates })
}

/// `import ... from "x"`, `export ... from "x"`, `require("x")`, `import("x")`
fn is_module_specifier(string: Node, source: &[u8]) -> bool {
    let Some(parent) = string.parent() else {
        return false;
    };
    match parent.kind() {
        "import_statement" | "export_statement" => true,
        "arguments" => parent
            .parent()
            .filter(|call| call.kind() == "call_expression")
            .and_then(|call| call.child_by_field_name("function"))
            .map_or(false, |callee| matches!(get_node_text(callee, source), "require" | "import")),
        _ => false,
    }
}
