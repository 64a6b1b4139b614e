//! Deterministic script engine for tests.
//!
//! Understands integer sums (`1+1`), `throw new Error('...')` on any line,
//! `sleep(ms)` and JSON literals, which are echoed back re-stringified.
//! `crash('...')` makes the engine itself panic.

use crate::bridge::context::ScriptContext;
use crate::bridge::engine::ScriptEngine;
use crate::bridge::evaluation::{EvalRequest, ExceptionDetail};
use std::time::Duration;

pub struct TestEngine;

const THROW_PREFIX: &str = "throw new Error(";

fn thrown_message(line: &str) -> Option<&str> {
    let start = line.find(THROW_PREFIX)? + THROW_PREFIX.len();
    let rest = &line[start..];
    let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let body = &rest[1..];
    body.find(quote).map(|end| &body[..end])
}

fn integer_sum(source: &str) -> Option<i64> {
    source
        .split('+')
        .map(|term| term.trim().parse::<i64>().ok())
        .sum()
}

impl ScriptEngine for TestEngine {
    fn evaluate(
        &self,
        _context: &ScriptContext,
        request: &EvalRequest,
    ) -> Result<String, ExceptionDetail> {
        for (offset, line) in request.source.lines().enumerate() {
            if let Some(message) = thrown_message(line) {
                let column = line.find(THROW_PREFIX).unwrap_or(0) as i64;
                return Err(ExceptionDetail {
                    message: format!("Uncaught Error: {}", message),
                    line_number: request.line + offset as i64,
                    start_column: column,
                    end_column: column + 1,
                    start_position: 0,
                    end_position: 0,
                    resource_name: request.url.clone(),
                    source_line: line.to_string(),
                });
            }
        }

        let source = request.source.trim();
        if let Some(reason) = source
            .strip_prefix("crash('")
            .and_then(|rest| rest.strip_suffix("')"))
        {
            panic!("{}", reason);
        }
        let sleep = source
            .strip_prefix("sleep(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|ms| ms.trim().parse::<u64>().ok());
        if let Some(ms) = sleep {
            std::thread::sleep(Duration::from_millis(ms));
            return Ok("null".to_string());
        }
        if let Some(sum) = integer_sum(source) {
            return Ok(sum.to_string());
        }
        match serde_json::from_str::<serde_json::Value>(source) {
            Ok(value) => Ok(value.to_string()),
            Err(_) => Err(ExceptionDetail {
                message: format!("Uncaught ReferenceError: {} is not defined", source),
                line_number: request.line,
                resource_name: request.url.clone(),
                source_line: source.to_string(),
                ..ExceptionDetail::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thrown_message() {
        assert_eq!(thrown_message("throw new Error('boom');"), Some("boom"));
        assert_eq!(thrown_message("  throw new Error(\"x y\")"), Some("x y"));
        assert_eq!(thrown_message("throw 1"), None);
        assert_eq!(integer_sum("1 + 1"), Some(2));
        assert_eq!(integer_sum("1 + a"), None);
    }
}
