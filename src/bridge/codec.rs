//! Wire codec for bridge frames.
//!
//! A frame is either a fire-and-forget [`Message`] (a name plus an ordered
//! list of primitive arguments) or one half of a request/response exchange.
//! Arguments are positional: producer and consumer agree on order and type
//! per message name, there is no schema negotiation.

use crate::bridge::context::FrameAddress;
use serde::{Deserialize, Serialize};

/// Fire-and-forget message names.
pub mod names {
    /// `[Int task_id, Int context_id, String source, String url, Int line]`
    pub const EVALUATION_REQUEST: &str = "jsbridge.evaluation.request";
    /// `[Int task_id, Bool success, String data, String message, Int line,
    /// Int start_column, Int end_column, Int start_position, Int end_position,
    /// String resource_name, String source_line]`
    pub const EVALUATION_RESPONSE: &str = "jsbridge.evaluation.response";
    /// `[String call_id, Bool success, String payload]`
    pub const SETTLE_PROMISE: &str = "jsbridge.promise.settle";
    /// `[Int context_id, Int frame_id, String json]`
    pub const POST_MESSAGE_TO_HOST: &str = "jsbridge.message.to_host";
    /// `[Int context_id, String payload, Bool as_json]`
    pub const POST_MESSAGE_TO_SCRIPT: &str = "jsbridge.message.to_script";
    /// `[Int context_id, Int session_id, Int frame_id]`
    pub const CONTEXT_CREATED: &str = "jsbridge.context.created";
    /// `[Int context_id]`
    pub const CONTEXT_RELEASED: &str = "jsbridge.context.released";

    /// Request names (request/response pattern).
    pub const GET_NATIVE_OBJECT: &str = "jsbridge.object.get";
    pub const GET_PROPERTY: &str = "jsbridge.property.get";
    pub const SET_PROPERTY: &str = "jsbridge.property.set";
    pub const CALL_METHOD: &str = "jsbridge.method.call";
}

/// Typed decode failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("message '{name}' is missing argument {index}")]
    MissingArgument { name: String, index: usize },

    #[error("message '{name}' argument {index} expected {expected}, found {found}")]
    TypeMismatch {
        name: String,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("message '{name}' expected {expected} arguments, found {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// A primitive message argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Arg {
    #[serde(rename = "i")]
    Int(i64),
    #[serde(rename = "s")]
    Str(String),
    #[serde(rename = "b")]
    Bool(bool),
}

impl Arg {
    fn kind(&self) -> &'static str {
        match self {
            Arg::Int(_) => "int",
            Arg::Str(_) => "string",
            Arg::Bool(_) => "bool",
        }
    }
}

/// A named message with positional arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn int(mut self, value: i64) -> Self {
        self.args.push(Arg::Int(value));
        self
    }

    pub fn string(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg::Str(value.into()));
        self
    }

    pub fn boolean(mut self, value: bool) -> Self {
        self.args.push(Arg::Bool(value));
        self
    }

    /// Sequential typed reader over the arguments, checking the arity first.
    pub fn reader(&self, arity: usize) -> Result<ArgReader<'_>, CodecError> {
        if self.args.len() != arity {
            return Err(CodecError::Arity {
                name: self.name.clone(),
                expected: arity,
                found: self.args.len(),
            });
        }
        Ok(ArgReader {
            message: self,
            index: 0,
        })
    }
}

/// Cursor that reads message arguments in order.
pub struct ArgReader<'a> {
    message: &'a Message,
    index: usize,
}

impl<'a> ArgReader<'a> {
    fn next(&mut self) -> Result<&'a Arg, CodecError> {
        let arg = self
            .message
            .args
            .get(self.index)
            .ok_or_else(|| CodecError::MissingArgument {
                name: self.message.name.clone(),
                index: self.index,
            })?;
        self.index += 1;
        Ok(arg)
    }

    fn mismatch(&self, expected: &'static str, found: &Arg) -> CodecError {
        CodecError::TypeMismatch {
            name: self.message.name.clone(),
            index: self.index - 1,
            expected,
            found: found.kind(),
        }
    }

    pub fn int(&mut self) -> Result<i64, CodecError> {
        match self.next()? {
            Arg::Int(v) => Ok(*v),
            other => Err(self.mismatch("int", other)),
        }
    }

    pub fn string(&mut self) -> Result<&'a str, CodecError> {
        match self.next()? {
            Arg::Str(v) => Ok(v.as_str()),
            other => Err(self.mismatch("string", other)),
        }
    }

    pub fn boolean(&mut self) -> Result<bool, CodecError> {
        match self.next()? {
            Arg::Bool(v) => Ok(*v),
            other => Err(self.mismatch("bool", other)),
        }
    }
}

/// Synchronous-style request addressed to a frame of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub name: String,
    pub address: FrameAddress,
    pub payload: String,
}

/// Reply to exactly one [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub name: String,
    pub address: FrameAddress,
    pub payload: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(request: &RequestEnvelope, payload: String) -> Self {
        Self {
            request_id: request.request_id,
            name: request.name.clone(),
            address: request.address,
            payload,
            success: true,
            error_message: None,
        }
    }

    pub fn failure(request: &RequestEnvelope, message: String) -> Self {
        Self {
            request_id: request.request_id,
            name: request.name.clone(),
            address: request.address,
            payload: String::new(),
            success: false,
            error_message: Some(message),
        }
    }
}

/// Unit of transfer on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Message(Message),
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(frame).map_err(|e| CodecError::Malformed(e.to_string()))
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
}
