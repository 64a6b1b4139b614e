//! jsbridge
//!
//! Lets script running in an isolated process read, write and call objects
//! owned by a host process, lets the host evaluate script remotely, and lets
//! asynchronous native calls settle script promises, all over a
//! message-passing channel. See [`bridge`] for the moving parts.

pub mod bridge;

pub use bridge::{
    AsyncCall, BridgeConfig, BridgeError, ContextId, DynamicProxy, EvalResult, HostBridge,
    JSValue, LocalChannel, NativeProxy, PostMode, ScriptBridge, ScriptContext, ScriptEngine,
    ScriptPromise,
};
