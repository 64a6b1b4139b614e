//! Remote evaluation: the host submits script source to a context in the
//! script process and gets back a typed result or a structured exception.
//!
//! Requests and results travel as positional messages correlated by a task ID
//! drawn from a per-session atomic counter.

use crate::bridge::codec::{names, CodecError, Message};
use crate::bridge::context::ContextId;
use crate::bridge::error::BridgeError;
use crate::bridge::js_value::JSValue;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::oneshot;

/// Diagnostic fields of an exception raised by evaluated script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDetail {
    pub message: String,
    pub line_number: i64,
    pub start_column: i64,
    pub end_column: i64,
    pub start_position: i64,
    pub end_position: i64,
    pub resource_name: String,
    pub source_line: String,
}

impl ExceptionDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub(crate) fn describe(&self) -> String {
        if self.resource_name.is_empty() {
            format!("{} (line {})", self.message, self.line_number)
        } else {
            format!(
                "{} ({}:{}:{})",
                self.message, self.resource_name, self.line_number, self.start_column
            )
        }
    }
}

/// Source submitted for remote evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalRequest {
    pub task_id: i64,
    pub context: ContextId,
    pub source: String,
    pub url: String,
    pub line: i64,
}

impl EvalRequest {
    pub(crate) fn to_message(&self) -> Message {
        Message::new(names::EVALUATION_REQUEST)
            .int(self.task_id)
            .int(self.context.0 as i64)
            .string(self.source.as_str())
            .string(self.url.as_str())
            .int(self.line)
    }

    pub(crate) fn from_message(message: &Message) -> Result<Self, CodecError> {
        let mut reader = message.reader(5)?;
        Ok(Self {
            task_id: reader.int()?,
            context: ContextId(reader.int()? as u64),
            source: reader.string()?.to_string(),
            url: reader.string()?.to_string(),
            line: reader.int()?,
        })
    }
}

/// Completion of one remote evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub task_id: i64,
    pub success: bool,
    /// Result as stringified by the script engine; empty on failure.
    pub data: String,
    /// Marshalled result, present when a detailed result was requested.
    pub value: Option<JSValue>,
    pub exception: Option<ExceptionDetail>,
}

impl EvalResult {
    pub(crate) fn to_message(&self) -> Message {
        let detail = self.exception.clone().unwrap_or_default();
        Message::new(names::EVALUATION_RESPONSE)
            .int(self.task_id)
            .boolean(self.success)
            .string(self.data.as_str())
            .string(detail.message)
            .int(detail.line_number)
            .int(detail.start_column)
            .int(detail.end_column)
            .int(detail.start_position)
            .int(detail.end_position)
            .string(detail.resource_name)
            .string(detail.source_line)
    }

    pub(crate) fn from_message(message: &Message) -> Result<Self, CodecError> {
        let mut reader = message.reader(11)?;
        let task_id = reader.int()?;
        let success = reader.boolean()?;
        let data = reader.string()?.to_string();
        let detail = ExceptionDetail {
            message: reader.string()?.to_string(),
            line_number: reader.int()?,
            start_column: reader.int()?,
            end_column: reader.int()?,
            start_position: reader.int()?,
            end_position: reader.int()?,
            resource_name: reader.string()?.to_string(),
            source_line: reader.string()?.to_string(),
        };
        Ok(Self {
            task_id,
            success,
            data,
            value: None,
            exception: if success { None } else { Some(detail) },
        })
    }

    /// Data on success, the exception as an error otherwise.
    pub fn into_result(self) -> Result<String, BridgeError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(BridgeError::Evaluation(self.exception.unwrap_or_default()))
        }
    }
}

/// Future completed exactly once by the matching evaluation result.
pub type EvalFuture = BoxFuture<'static, Result<EvalResult, BridgeError>>;

struct PendingEvaluation {
    context: ContextId,
    detailed: bool,
    slot: oneshot::Sender<Result<EvalResult, BridgeError>>,
}

/// Host-side table of in-flight evaluations.
pub struct EvaluationChannel {
    next_task_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingEvaluation>>,
}

impl Default for EvaluationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationChannel {
    pub fn new() -> Self {
        Self {
            next_task_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a task ID and its single-assignment result slot.
    pub fn begin(
        &self,
        context: ContextId,
        detailed: bool,
    ) -> Result<(i64, EvalFuture), BridgeError> {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.pending.lock().entry(task_id) {
            Entry::Occupied(_) => {
                tracing::error!(task_id, "evaluation task id already pending");
                return Err(BridgeError::Protocol(format!(
                    "evaluation task {} is already pending",
                    task_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingEvaluation {
                    context,
                    detailed,
                    slot: tx,
                });
            }
        }

        let future = async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::ContextReleased(context)),
            }
        }
        .boxed();
        Ok((task_id, future))
    }

    /// Deliver a result; `marshal` builds the detailed value when requested.
    /// Returns false when no evaluation was waiting for this task ID.
    pub fn complete(&self, mut result: EvalResult, marshal: impl FnOnce(&str) -> JSValue) -> bool {
        let Some(pending) = self.pending.lock().remove(&result.task_id) else {
            tracing::warn!(task_id = result.task_id, "discarding result for unknown evaluation");
            return false;
        };
        if pending.detailed && result.success {
            result.value = Some(marshal(&result.data));
        }
        let _ = pending.slot.send(Ok(result));
        true
    }

    /// Fail an evaluation that could not be sent.
    pub fn fail(&self, task_id: i64, error: BridgeError) -> bool {
        match self.pending.lock().remove(&task_id) {
            Some(pending) => {
                let _ = pending.slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Cancel every evaluation owned by `context`.
    pub fn cancel_context(&self, context: ContextId) -> usize {
        let cancelled: Vec<PendingEvaluation> = {
            let mut pending = self.pending.lock();
            let ids: Vec<i64> = pending
                .iter()
                .filter(|(_, p)| p.context == context)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let count = cancelled.len();
        for pending in cancelled {
            let _ = pending.slot.send(Err(BridgeError::ContextReleased(context)));
        }
        if count > 0 {
            tracing::debug!(context_id = %context, count, "cancelled pending evaluations");
        }
        count
    }

    /// Cancel everything; used at session teardown.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEvaluation> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let context = pending.context;
            let _ = pending.slot.send(Err(BridgeError::ContextReleased(context)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
