//! Error taxonomy for the bridge.
//!
//! Every failure that can reach script is rendered with a `[Bridge] ` prefix.
//! Host-side faults are turned into failure responses before they cross the
//! process boundary; the peer rebuilds them as [`BridgeError::Remote`].

use crate::bridge::codec::CodecError;
use crate::bridge::context::ContextId;
use crate::bridge::evaluation::ExceptionDetail;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Unknown object handle or object name.
    #[error("[Bridge] object {0} not found")]
    ObjectNotFound(String),

    /// Property or function name not recognized on the target.
    #[error("[Bridge] member '{member}' is not applicable to object {object_id}")]
    MemberNotApplicable { object_id: i64, member: String },

    /// A native call raised an error; only its message is kept.
    #[error("[Bridge] native call '{member}' failed: {message}")]
    InvocationFailure { member: String, message: String },

    /// Script raised during remote evaluation.
    #[error("[Bridge] {}", .0.describe())]
    Evaluation(ExceptionDetail),

    /// The owning execution context went away while the call was pending.
    #[error("[Bridge] execution context {0} was released")]
    ContextReleased(ContextId),

    #[error("[Bridge] codec error: {0}")]
    Codec(#[from] CodecError),

    /// Failure response produced by the peer process.
    #[error("{0}")]
    Remote(String),

    #[error("[Bridge] call '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("[Bridge] channel closed")]
    ChannelClosed,

    #[error("[Bridge] protocol violation: {0}")]
    Protocol(String),

    #[error("[Bridge] invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether this error is the cancellation-class outcome of context teardown.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BridgeError::ContextReleased(_))
    }

    /// Rebuild a failure response message received from the peer.
    pub(crate) fn remote(message: Option<String>) -> Self {
        match message {
            Some(message) if !message.trim().is_empty() => BridgeError::Remote(message),
            _ => BridgeError::Remote("[Bridge] remote call failed without a message".to_string()),
        }
    }
}

/// Text carried by a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked without a message".to_string()
    }
}
