//! Bridge configuration shared by the host and script facades.
//!
//! This module defines the knobs that bound blocking calls, cap the
//! marshaller's unwrap loop and name the threads the bridge spawns.

use crate::bridge::error::BridgeError;
use std::time::Duration;

/// Default upper bound for a blocking request/response call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on nested string unwrapping in the value marshaller.
pub const DEFAULT_MAX_UNWRAP_DEPTH: usize = 8;

/// Configuration for one bridge session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Session identifier stamped on every request envelope.
    pub session_id: i64,

    /// Worst-case wait for a blocking call (None = wait until the response
    /// arrives or the calling context is released).
    pub call_timeout: Option<Duration>,

    /// Maximum number of double-encoding unwrap iterations.
    pub max_unwrap_depth: usize,

    /// Prefix for the dispatch and context queue thread names.
    pub thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            session_id: 1,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            max_unwrap_depth: DEFAULT_MAX_UNWRAP_DEPTH,
            thread_name: "jsbridge".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, session_id: i64) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Disable the blocking call bound; only context teardown ends a wait.
    pub fn without_call_timeout(mut self) -> Self {
        self.call_timeout = None;
        self
    }

    pub fn with_max_unwrap_depth(mut self, depth: usize) -> Self {
        self.max_unwrap_depth = depth;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.max_unwrap_depth == 0 {
            return Err(BridgeError::Config(
                "max_unwrap_depth must be at least 1".to_string(),
            ));
        }
        if self.thread_name.trim().is_empty() {
            return Err(BridgeError::Config(
                "thread_name cannot be empty".to_string(),
            ));
        }
        if let Some(timeout) = self.call_timeout {
            if timeout.is_zero() {
                return Err(BridgeError::Config(
                    "call_timeout must be positive; use without_call_timeout to disable it"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn thread_label(&self, role: &str) -> String {
        format!("{}-{}", self.thread_name, role)
    }
}
