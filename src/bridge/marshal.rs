//! Conversion of transport payload strings into engine values.
//!
//! Payloads are produced ad hoc by native code and may be a bare scalar, a
//! quoted JSON string, a JSON string wrapping another JSON document, or a
//! compound document. [`Marshaller::to_engine_value`] normalizes all of these
//! and never fails: anything that does not fit degrades to an opaque string.

use crate::bridge::config::DEFAULT_MAX_UNWRAP_DEPTH;
use crate::bridge::engine::{serde_json_parse, JsonParser};
use crate::bridge::js_value::{parse_date, JSValue};
use std::sync::Arc;

#[derive(Clone)]
pub struct Marshaller {
    max_unwrap_depth: usize,
    parse_json: JsonParser,
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNWRAP_DEPTH)
    }
}

impl Marshaller {
    /// Marshaller backed by serde_json for compound values.
    pub fn new(max_unwrap_depth: usize) -> Self {
        Self::with_parser(max_unwrap_depth, Arc::new(serde_json_parse))
    }

    /// Marshaller that hands compound documents to `parse_json`.
    pub fn with_parser(max_unwrap_depth: usize, parse_json: JsonParser) -> Self {
        Self {
            max_unwrap_depth: max_unwrap_depth.max(1),
            parse_json,
        }
    }

    /// Convert a payload into an engine value. `None` is undefined.
    pub fn to_engine_value(&self, payload: Option<&str>) -> JSValue {
        let Some(raw) = payload else {
            return JSValue::Undefined;
        };

        if let Some(infinite) = overflowing_number(raw.trim()) {
            return JSValue::Float(infinite);
        }

        let text = if needs_quoting(raw) {
            match serde_json::to_string(raw) {
                Ok(quoted) => quoted,
                Err(_) => return self.fallback(raw, "quoting failed"),
            }
        } else {
            raw.to_string()
        };

        let mut current = text;
        for _ in 0..self.max_unwrap_depth {
            let parsed: serde_json::Value = match serde_json::from_str(&current) {
                Ok(v) => v,
                Err(_) => return self.fallback(raw, "payload is not valid JSON"),
            };

            match parsed {
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    return match (self.parse_json)(&current) {
                        Ok(value) => value,
                        Err(_) => self.fallback(raw, "engine rejected compound payload"),
                    };
                }
                serde_json::Value::String(content) => {
                    if let Some(date) = parse_date(&content) {
                        return JSValue::Date(date);
                    }
                    if looks_like_json_document(&content) {
                        current = content;
                        continue;
                    }
                    return JSValue::String(content);
                }
                serde_json::Value::Number(number) => return number_value(&number),
                serde_json::Value::Bool(b) => return JSValue::Bool(b),
                serde_json::Value::Null => return JSValue::Null,
            }
        }

        self.fallback(raw, "unwrap depth exceeded")
    }

    /// Convert a payload that is always present.
    pub fn marshal(&self, payload: &str) -> JSValue {
        self.to_engine_value(Some(payload))
    }

    fn fallback(&self, raw: &str, reason: &'static str) -> JSValue {
        tracing::debug!(reason, len = raw.len(), "marshalling fell back to opaque string");
        JSValue::String(raw.to_string())
    }
}

fn is_quote_delimited(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('"') && text.ends_with('"')
}

fn is_compound_shaped(text: &str) -> bool {
    (text.starts_with('{') && text.ends_with('}')) || (text.starts_with('[') && text.ends_with(']'))
}

/// A payload is taken as a literal string unless it already reads as a JSON
/// scalar, a quoted string or a compound document.
fn needs_quoting(raw: &str) -> bool {
    let trimmed = raw.trim();
    let is_scalar = matches!(trimmed, "true" | "false" | "null")
        || (!trimmed.is_empty() && serde_json::from_str::<serde_json::Number>(trimmed).is_ok());
    !(is_scalar || is_quote_delimited(trimmed) || is_compound_shaped(trimmed))
}

/// Unwrapped string content that itself parses as a JSON document.
fn looks_like_json_document(content: &str) -> bool {
    let trimmed = content.trim();
    (is_quote_delimited(trimmed) || is_compound_shaped(trimmed))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
}

fn number_value(number: &serde_json::Number) -> JSValue {
    if let Some(i) = number.as_i64() {
        return JSValue::Int(i);
    }
    match number.as_f64() {
        Some(f) => JSValue::from_f64(f),
        None => JSValue::String(number.to_string()),
    }
}

/// JSON number grammar: `-? int frac? exp?`.
fn is_number_literal(text: &str) -> bool {
    fn digits(bytes: &[u8], mut at: usize) -> usize {
        while at < bytes.len() && bytes[at].is_ascii_digit() {
            at += 1;
        }
        at
    }

    let bytes = text.as_bytes();
    let mut at = usize::from(bytes.first() == Some(&b'-'));
    let start = at;
    at = digits(bytes, at);
    if at == start || (bytes[start] == b'0' && at - start > 1) {
        return false;
    }
    if bytes.get(at) == Some(&b'.') {
        let frac = at + 1;
        at = digits(bytes, frac);
        if at == frac {
            return false;
        }
    }
    if matches!(bytes.get(at), Some(b'e' | b'E')) {
        at += 1;
        if matches!(bytes.get(at), Some(b'+' | b'-')) {
            at += 1;
        }
        let exp = at;
        at = digits(bytes, exp);
        if at == exp {
            return false;
        }
    }
    at == bytes.len()
}

/// Number literal beyond the f64 range, such as `1e400`, as a signed infinity.
fn overflowing_number(text: &str) -> Option<f64> {
    if !is_number_literal(text) {
        return None;
    }
    text.parse::<f64>().ok().filter(|f| f.is_infinite())
}
