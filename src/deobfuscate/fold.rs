//! Constant folding over pure literal expressions.
//!
//! The evaluator only ever looks at literals and operators. Identifiers, calls,
//! member access and anything else with possible side effects are "not
//! foldable" and stop evaluation of the enclosing expression.

use std::cmp::Ordering;

use tracing::debug;
use tree_sitter::Node;

use crate::deobfuscate::common::{get_node_text, visit_nodes, Edit};
use crate::deobfuscate::error::Result;
use crate::deobfuscate::parser::SourceUnit;
use crate::deobfuscate::preprocess::decode_escape;

// ============ Constants ============

pub const MAX_FOLD_ITERATIONS: usize = 5;

/// Deeper expressions are folded bottom-up across iterations instead
const MAX_EVAL_DEPTH: usize = 256;

const STAGE: &str = "fold";

// ============ Values ============

/// Primitive value produced by the evaluator
#[derive(Debug, Clone, PartialEq)]
pub enum JsValue {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
}

impl JsValue {
    pub fn to_number(&self) -> f64 {
        match self {
            JsValue::Number(n) => *n,
            JsValue::Str(s) => string_to_number(s),
            JsValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            JsValue::Null => 0.0,
            JsValue::Undefined => f64::NAN,
        }
    }

    pub fn to_js_string(&self) -> String {
        match self {
            JsValue::Number(n) => format_number(*n),
            JsValue::Str(s) => s.clone(),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Undefined => "undefined".to_string(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            JsValue::Number(n) => !(*n == 0.0 || n.is_nan()),
            JsValue::Str(s) => !s.is_empty(),
            JsValue::Bool(b) => *b,
            JsValue::Null | JsValue::Undefined => false,
        }
    }

    fn type_of(&self) -> &'static str {
        match self {
            JsValue::Number(_) => "number",
            JsValue::Str(_) => "string",
            JsValue::Bool(_) => "boolean",
            JsValue::Null => "object",
            JsValue::Undefined => "undefined",
        }
    }

    fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Null | JsValue::Undefined)
    }
}

/// `Number#toString()` for base 10
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n < 0.0 {
        return format!("-{}", format_number(-n));
    }

    // Shortest round-trip digits plus decimal exponent
    let sci = format!("{:e}", n);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    let digits: String = mantissa.chars().filter(|c| c.is_ascii_digit()).collect();
    let k = digits.len() as i32;
    let point = exp + 1;

    if k <= point && point <= 21 {
        format!("{}{}", digits, "0".repeat((point - k) as usize))
    } else if 0 < point && point <= 21 {
        let (int, frac) = digits.split_at(point as usize);
        format!("{}.{}", int, frac)
    } else if -6 < point && point <= 0 {
        format!("0.{}{}", "0".repeat((-point) as usize), digits)
    } else {
        let e = point - 1;
        let sign = if e >= 0 { "+" } else { "-" };
        if k == 1 {
            format!("{}e{}{}", digits, sign, e.abs())
        } else {
            format!("{}.{}e{}{}", &digits[..1], &digits[1..], sign, e.abs())
        }
    }
}

fn string_to_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    let lower = t.to_ascii_lowercase();
    for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return parse_radix(rest, radix).unwrap_or(f64::NAN);
        }
    }
    if !is_decimal_literal(t) {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

/// Digits, optional fraction, optional exponent; rejects Rust-only spellings like `inf`
fn is_decimal_literal(t: &str) -> bool {
    let body = t.strip_prefix(['+', '-']).unwrap_or(t);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(i) => (&body[..i], Some(&body[i + 1..])),
        None => (body, None),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits_ok = int.chars().all(|c| c.is_ascii_digit()) && frac.chars().all(|c| c.is_ascii_digit());
    if !digits_ok || (int.is_empty() && frac.is_empty()) {
        return false;
    }
    match exponent {
        None => true,
        Some(e) => {
            let e = e.strip_prefix(['+', '-']).unwrap_or(e);
            !e.is_empty() && e.chars().all(|c| c.is_ascii_digit())
        }
    }
}

fn parse_radix(digits: &str, radix: u32) -> Option<f64> {
    if digits.is_empty() {
        return None;
    }
    let mut value = 0f64;
    for c in digits.chars() {
        value = value * radix as f64 + c.to_digit(radix)? as f64;
    }
    Some(value)
}

fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let m = n.trunc().rem_euclid(4_294_967_296.0);
    if m >= 2_147_483_648.0 {
        (m - 4_294_967_296.0) as i32
    } else {
        m as i32
    }
}

fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32
}

// ============ Operators ============

pub fn apply_unary(op: &str, value: JsValue) -> Option<JsValue> {
    let result = match op {
        "!" => JsValue::Bool(!value.truthy()),
        "-" => JsValue::Number(-value.to_number()),
        "+" => JsValue::Number(value.to_number()),
        "~" => JsValue::Number(!to_int32(value.to_number()) as f64),
        "typeof" => JsValue::Str(value.type_of().to_string()),
        "void" => JsValue::Undefined,
        _ => return None,
    };
    Some(result)
}

pub fn apply_binary(op: &str, left: JsValue, right: JsValue) -> Option<JsValue> {
    let num = |l: &JsValue, r: &JsValue| (l.to_number(), r.to_number());
    let result = match op {
        "+" => match (&left, &right) {
            (JsValue::Str(_), _) | (_, JsValue::Str(_)) => {
                JsValue::Str(left.to_js_string() + &right.to_js_string())
            }
            _ => JsValue::Number(left.to_number() + right.to_number()),
        },
        "-" => {
            let (l, r) = num(&left, &right);
            JsValue::Number(l - r)
        }
        "*" => {
            let (l, r) = num(&left, &right);
            JsValue::Number(l * r)
        }
        "/" => {
            let (l, r) = num(&left, &right);
            JsValue::Number(l / r)
        }
        "%" => {
            let (l, r) = num(&left, &right);
            JsValue::Number(l % r)
        }
        "**" => {
            let (l, r) = num(&left, &right);
            JsValue::Number(js_pow(l, r))
        }
        "<<" => {
            let (l, r) = num(&left, &right);
            JsValue::Number(to_int32(l).wrapping_shl(to_uint32(r) & 31) as f64)
        }
        ">>" => {
            let (l, r) = num(&left, &right);
            JsValue::Number(to_int32(l).wrapping_shr(to_uint32(r) & 31) as f64)
        }
        ">>>" => {
            let (l, r) = num(&left, &right);
            JsValue::Number(to_uint32(l).wrapping_shr(to_uint32(r) & 31) as f64)
        }
        "&" => {
            let (l, r) = num(&left, &right);
            JsValue::Number((to_int32(l) & to_int32(r)) as f64)
        }
        "|" => {
            let (l, r) = num(&left, &right);
            JsValue::Number((to_int32(l) | to_int32(r)) as f64)
        }
        "^" => {
            let (l, r) = num(&left, &right);
            JsValue::Number((to_int32(l) ^ to_int32(r)) as f64)
        }
        "<" => JsValue::Bool(compare(&left, &right) == Some(Ordering::Less)),
        ">" => JsValue::Bool(compare(&left, &right) == Some(Ordering::Greater)),
        "<=" => JsValue::Bool(matches!(compare(&left, &right), Some(Ordering::Less | Ordering::Equal))),
        ">=" => JsValue::Bool(matches!(
            compare(&left, &right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        "===" => JsValue::Bool(strict_equals(&left, &right)),
        "!==" => JsValue::Bool(!strict_equals(&left, &right)),
        "==" => JsValue::Bool(loose_equals(&left, &right)),
        "!=" => JsValue::Bool(!loose_equals(&left, &right)),
        "&&" => {
            if left.truthy() {
                right
            } else {
                left
            }
        }
        "||" => {
            if left.truthy() {
                left
            } else {
                right
            }
        }
        "??" => {
            if left.is_nullish() {
                right
            } else {
                left
            }
        }
        _ => return None,
    };
    Some(result)
}

fn js_pow(base: f64, exp: f64) -> f64 {
    if exp.is_nan() || (base.abs() == 1.0 && exp.is_infinite()) {
        return f64::NAN;
    }
    base.powf(exp)
}

/// Abstract relational comparison; `None` when either side is NaN
fn compare(left: &JsValue, right: &JsValue) -> Option<Ordering> {
    if let (JsValue::Str(l), JsValue::Str(r)) = (left, right) {
        return Some(l.encode_utf16().cmp(r.encode_utf16()));
    }
    left.to_number().partial_cmp(&right.to_number())
}

fn strict_equals(left: &JsValue, right: &JsValue) -> bool {
    match (left, right) {
        (JsValue::Number(l), JsValue::Number(r)) => l == r,
        (JsValue::Str(l), JsValue::Str(r)) => l == r,
        (JsValue::Bool(l), JsValue::Bool(r)) => l == r,
        (JsValue::Null, JsValue::Null) | (JsValue::Undefined, JsValue::Undefined) => true,
        _ => false,
    }
}

fn loose_equals(left: &JsValue, right: &JsValue) -> bool {
    match (left, right) {
        (l, r) if std::mem::discriminant(l) == std::mem::discriminant(r) => strict_equals(l, r),
        (JsValue::Null, JsValue::Undefined) | (JsValue::Undefined, JsValue::Null) => true,
        (JsValue::Null | JsValue::Undefined, _) | (_, JsValue::Null | JsValue::Undefined) => false,
        (JsValue::Bool(_), other) => loose_equals(&JsValue::Number(left.to_number()), other),
        (other, JsValue::Bool(_)) => loose_equals(other, &JsValue::Number(right.to_number())),
        (JsValue::Number(l), JsValue::Str(_)) => *l == right.to_number(),
        (JsValue::Str(_), JsValue::Number(r)) => left.to_number() == *r,
        _ => false,
    }
}

// ============ Evaluation ============

/// Evaluate a literal-only expression; `None` when anything is not foldable
pub fn evaluate(node: Node, source: &[u8]) -> Option<JsValue> {
    evaluate_rec(node, source, 0)
}

fn evaluate_rec(node: Node, source: &[u8], depth: usize) -> Option<JsValue> {
    if depth > MAX_EVAL_DEPTH || node.has_error() {
        return None;
    }
    match node.kind() {
        "number" => parse_number_literal(get_node_text(node, source)).map(JsValue::Number),
        "string" => string_literal_value(node, source).map(JsValue::Str),
        "true" => Some(JsValue::Bool(true)),
        "false" => Some(JsValue::Bool(false)),
        "null" => Some(JsValue::Null),
        "parenthesized_expression" => {
            if node.named_child_count() != 1 {
                return None;
            }
            evaluate_rec(node.named_child(0)?, source, depth + 1)
        }
        "unary_expression" => {
            let op = node.child_by_field_name("operator")?;
            let argument = node.child_by_field_name("argument")?;
            let value = evaluate_rec(argument, source, depth + 1)?;
            apply_unary(op.kind(), value)
        }
        "binary_expression" => {
            let op = node.child_by_field_name("operator")?;
            let left = evaluate_rec(node.child_by_field_name("left")?, source, depth + 1)?;
            let right = evaluate_rec(node.child_by_field_name("right")?, source, depth + 1)?;
            apply_binary(op.kind(), left, right)
        }
        "ternary_expression" => {
            let condition = evaluate_rec(node.child_by_field_name("condition")?, source, depth + 1)?;
            let consequence = evaluate_rec(node.child_by_field_name("consequence")?, source, depth + 1)?;
            let alternative = evaluate_rec(node.child_by_field_name("alternative")?, source, depth + 1)?;
            Some(if condition.truthy() { consequence } else { alternative })
        }
        _ => None,
    }
}

/// Numeric literal text to its value; BigInt and legacy octal are not foldable
pub fn parse_number_literal(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|&c| c != '_').collect();
    if cleaned.ends_with('n') {
        return None;
    }
    let lower = cleaned.to_ascii_lowercase();
    for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return parse_radix(rest, radix);
        }
    }
    if cleaned.len() > 1 && cleaned.starts_with('0') && cleaned.as_bytes()[1].is_ascii_digit() {
        return None;
    }
    if !is_decimal_literal(&cleaned) {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Cooked value of a string literal node
pub fn string_literal_value(node: Node, source: &[u8]) -> Option<String> {
    let mut value = String::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "\"" | "'" => {}
            "string_fragment" => value.push_str(get_node_text(child, source)),
            "escape_sequence" => value.push_str(&cook_escape(get_node_text(child, source))?),
            _ => return None,
        }
    }
    Some(value)
}

fn cook_escape(escape: &str) -> Option<String> {
    let body = escape.strip_prefix('\\')?;
    let cooked = match body {
        "n" => "\n".to_string(),
        "t" => "\t".to_string(),
        "r" => "\r".to_string(),
        "b" => "\u{8}".to_string(),
        "f" => "\u{c}".to_string(),
        "v" => "\u{b}".to_string(),
        "0" => "\0".to_string(),
        "\n" | "\r\n" | "\r" | "\u{2028}" | "\u{2029}" => String::new(),
        _ if body.starts_with('x') || body.starts_with('u') => decode_escape(escape)?.to_string(),
        _ => {
            let mut chars = body.chars();
            let c = chars.next()?;
            if chars.next().is_some() || c.is_ascii_digit() {
                return None;
            }
            c.to_string()
        }
    };
    Some(cooked)
}

// ============ Rendering ============

/// Double-quoted JavaScript string literal
pub fn quote_string(value: &str, quote: char) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\u{b}' => out.push_str("\\v"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Literal text for a value, or `None` for values without a stable literal
fn render_value(value: &JsValue) -> Option<String> {
    match value {
        JsValue::Number(n) if !n.is_finite() => None,
        JsValue::Number(n) if *n == 0.0 && n.is_sign_negative() => Some("-0".to_string()),
        JsValue::Number(n) => Some(format_number(*n)),
        JsValue::Str(s) => Some(quote_string(s, '"')),
        JsValue::Bool(b) => Some(b.to_string()),
        JsValue::Null => Some("null".to_string()),
        JsValue::Undefined => Some("void 0".to_string()),
    }
}

fn needs_parens(value: &JsValue, rendered: &str, parent_kind: &str) -> bool {
    match parent_kind {
        "member_expression" | "subscript_expression" | "call_expression" => {
            matches!(value, JsValue::Number(_) | JsValue::Undefined)
        }
        "unary_expression" | "binary_expression" | "update_expression" => {
            rendered.starts_with('-') || matches!(value, JsValue::Undefined)
        }
        _ => false,
    }
}

fn is_composite(kind: &str) -> bool {
    matches!(
        kind,
        "binary_expression" | "unary_expression" | "ternary_expression" | "parenthesized_expression"
    )
}

// ============ Folding Pass ============

#[derive(Debug)]
pub struct FoldOutcome {
    pub unit: SourceUnit,
    pub folds: usize,
    pub iterations: usize,
}

/// Fold to a fixed point, bounded by `MAX_FOLD_ITERATIONS`
pub fn fold_constants(unit: &SourceUnit) -> Result<FoldOutcome> {
    let mut current = unit.clone();
    let mut folds = 0usize;
    let mut iterations = 0usize;

    while iterations < MAX_FOLD_ITERATIONS {
        let edits = collect_fold_edits(current.root(), current.source());
        iterations += 1;
        if edits.is_empty() {
            break;
        }
        folds += edits.len();
        current = current.rewrite(STAGE, &edits)?;
    }

    debug!(folds, iterations, "constant folding finished");
    Ok(FoldOutcome {
        unit: current,
        folds,
        iterations,
    })
}

fn collect_fold_edits(root: Node, source: &[u8]) -> Vec<Edit> {
    let mut edits = Vec::new();
    visit_nodes(root, |node| {
        if !is_composite(node.kind()) {
            return true;
        }
        if node.kind() == "parenthesized_expression" {
            let inner_composite = node.named_child(0).map_or(false, |inner| is_composite(inner.kind()));
            // `if (...)` and friends own their parentheses
            let statement_condition = node.parent().map_or(false, |p| {
                matches!(
                    p.kind(),
                    "if_statement" | "while_statement" | "do_statement" | "switch_statement" | "with_statement"
                )
            });
            if !inner_composite || statement_condition {
                return true;
            }
        }
        let Some(value) = evaluate(node, source) else {
            return true;
        };
        let Some(rendered) = render_value(&value) else {
            return true;
        };
        let text = get_node_text(node, source);
        if rendered == text {
            return false;
        }
        let parent_kind = node.parent().map_or("", |p| p.kind());
        // A string statement at the top of a body would turn into a directive
        if parent_kind == "expression_statement" && matches!(value, JsValue::Str(_)) {
            return true;
        }
        let replacement = if needs_parens(&value, &rendered, parent_kind) {
            format!("({})", rendered)
        } else {
            rendered
        };
        if replacement != text {
            edits.push(Edit::replace(node, replacement));
        }
        false
    });
    edits
}
