//! Seam to the script engine living in the script process.
//!
//! The bridge never parses or stringifies compound script values on its own:
//! evaluation results arrive already stringified by the engine, and compound
//! payloads are materialized through the engine's JSON parser.

use crate::bridge::context::ScriptContext;
use crate::bridge::evaluation::{EvalRequest, ExceptionDetail};
use crate::bridge::js_value::JSValue;
use std::sync::Arc;

/// Shared handle to a JSON parse facility.
pub type JsonParser = Arc<dyn Fn(&str) -> Result<JSValue, String> + Send + Sync>;

/// Parse JSON text with serde_json; the fallback used when no engine is at hand.
pub fn serde_json_parse(text: &str) -> Result<JSValue, String> {
    serde_json::from_str(text).map_err(|e| e.to_string())
}

/// Script engine driven by the script-side facade.
///
/// Both methods are only ever called from the task queue of the context
/// they operate on.
pub trait ScriptEngine: Send + Sync + 'static {
    /// Run `request.source` inside `context` and return the produced value
    /// serialized with the engine's own JSON stringify.
    fn evaluate(
        &self,
        context: &ScriptContext,
        request: &EvalRequest,
    ) -> Result<String, ExceptionDetail>;

    /// Materialize a compound JSON document as an engine value.
    fn parse_json(&self, text: &str) -> Result<JSValue, String> {
        serde_json_parse(text)
    }
}

/// Wrap an engine's parser so the marshaller can hold it.
pub fn engine_parser(engine: Arc<dyn ScriptEngine>) -> JsonParser {
    Arc::new(move |text: &str| engine.parse_json(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_json_parse() {
        assert_eq!(serde_json_parse("[1]").unwrap(), JSValue::Array(vec![JSValue::Int(1)]));
        assert!(serde_json_parse("{").is_err());
    }
}
