//! Host-process facade.
//!
//! Owns the object registry and the evaluation channel, serves proxy
//! requests coming from script, and tracks which script contexts exist.
//! All inbound frames are handled on the endpoint's dispatch thread.

use crate::bridge::channel::{FrameHandler, LocalEndpoint, Transport};
use crate::bridge::codec::{names, Frame, Message, RequestEnvelope, ResponseEnvelope};
use crate::bridge::config::BridgeConfig;
use crate::bridge::context::{ContextId, FrameAddress};
use crate::bridge::error::{panic_message, BridgeError};
use crate::bridge::evaluation::{EvalFuture, EvalRequest, EvalResult, EvaluationChannel};
use crate::bridge::marshal::Marshaller;
use crate::bridge::promise::AsyncCall;
use crate::bridge::registry::{
    ApplyOutcome, AsyncStart, CallReply, CallRequest, NativeProxy, ObjectRegistry, PropertyRequest,
    SetPropertyRequest,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a host-posted payload is handed to script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostMode {
    /// Delivered as a plain string.
    AsString,
    /// Marshalled into an engine value first.
    AsJson,
}

/// Message posted by script to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMessage {
    pub context: ContextId,
    pub frame_id: i64,
    pub json: String,
}

pub type HostListener = Arc<dyn Fn(HostMessage) + Send + Sync>;

/// A successful request reply, optionally followed by an async native call.
struct Reply {
    payload: String,
    deferred: Option<(String, AsyncStart)>,
}

impl Reply {
    fn data(payload: String) -> Self {
        Self {
            payload,
            deferred: None,
        }
    }
}

pub struct HostBridge {
    config: BridgeConfig,
    transport: Arc<dyn Transport>,
    registry: ObjectRegistry,
    evaluations: EvaluationChannel,
    marshaller: Marshaller,
    contexts: Mutex<HashMap<ContextId, FrameAddress>>,
    listener: Mutex<Option<HostListener>>,
    shut_down: AtomicBool,
}

impl HostBridge {
    /// Build a host facade sending through `transport`. Inbound frames must be
    /// fed to [`FrameHandler::handle_frame`] by the caller.
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>, BridgeError> {
        config.validate()?;
        Ok(Arc::new(Self {
            marshaller: Marshaller::new(config.max_unwrap_depth),
            config,
            transport,
            registry: ObjectRegistry::new(),
            evaluations: EvaluationChannel::new(),
            contexts: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Build a host facade on a local endpoint and start its dispatch thread.
    pub fn connect(config: BridgeConfig, endpoint: Arc<LocalEndpoint>) -> Result<Arc<Self>, BridgeError> {
        let thread_name = config.thread_label("host");
        let bridge = Self::new(config, endpoint.clone())?;
        let handler: Arc<dyn FrameHandler> = bridge.clone();
        endpoint.start(thread_name, Arc::downgrade(&handler))?;
        Ok(bridge)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Expose `object` to script under `name`.
    pub fn register_object(&self, name: &str, object: Arc<dyn NativeProxy>) -> Result<(), BridgeError> {
        self.registry.register(name, object)
    }

    pub fn unregister_object(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// Script contexts currently known to be alive, in ID order.
    pub fn contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.contexts.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn context_address(&self, context: ContextId) -> Option<FrameAddress> {
        self.contexts.lock().get(&context).copied()
    }

    /// Evaluate `source` in a script context.
    ///
    /// The future completes with the engine's stringified result, or a failed
    /// [`EvalResult`] carrying the exception; it fails with
    /// [`BridgeError::ContextReleased`] if the context goes away first. With
    /// `detailed`, a successful result also carries the marshalled value.
    pub fn evaluate(
        &self,
        context: ContextId,
        source: &str,
        url: &str,
        line: i64,
        detailed: bool,
    ) -> EvalFuture {
        if self.is_shut_down() {
            return futures::future::ready(Err(BridgeError::ChannelClosed)).boxed();
        }

        let (task_id, future) = match self.evaluations.begin(context, detailed) {
            Ok(pending) => pending,
            Err(err) => return futures::future::ready(Err(err)).boxed(),
        };
        let request = EvalRequest {
            task_id,
            context,
            source: source.to_string(),
            url: url.to_string(),
            line,
        };
        tracing::debug!(task_id, context_id = %context, url, "evaluating script");

        if let Err(err) = self.transport.send(Frame::Message(request.to_message())) {
            self.evaluations.fail(task_id, err);
        }
        future
    }

    /// Number of evaluations still waiting for a result.
    pub fn pending_evaluations(&self) -> usize {
        self.evaluations.len()
    }

    /// Post a payload to a script context's message listener.
    pub fn post_message(&self, context: ContextId, payload: &str, mode: PostMode) -> Result<(), BridgeError> {
        if self.is_shut_down() {
            return Err(BridgeError::ChannelClosed);
        }
        let message = Message::new(names::POST_MESSAGE_TO_SCRIPT)
            .int(context.0 as i64)
            .string(payload)
            .boolean(mode == PostMode::AsJson);
        self.transport.send(Frame::Message(message))
    }

    /// Install the listener for messages posted by script. Replaces any
    /// previous listener.
    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(HostMessage) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Tear down the session. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.evaluations.cancel_all();
        self.registry.clear();
        self.contexts.lock().clear();
        self.listener.lock().take();
        self.transport.close();
        tracing::debug!(session_id = self.config.session_id, cancelled, "host bridge shut down");
    }

    fn handle_request(&self, request: RequestEnvelope) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(&request))).unwrap_or_else(|panic| {
            Err(BridgeError::InvocationFailure {
                member: request.name.clone(),
                message: panic_message(panic.as_ref()),
            })
        });

        let (response, deferred) = match outcome {
            Ok(reply) => (ResponseEnvelope::ok(&request, reply.payload), reply.deferred),
            Err(err) => {
                tracing::debug!(request_id = request.request_id, name = %request.name, error = %err, "request failed");
                (ResponseEnvelope::failure(&request, err.to_string()), None)
            }
        };
        if let Err(err) = self.transport.send(Frame::Response(response)) {
            tracing::warn!(request_id = request.request_id, error = %err, "failed to send response");
        }

        // Started after the pending reply went out so a quick settlement
        // cannot overtake it.
        if let Some((call_id, start)) = deferred {
            let call = AsyncCall::new(call_id.clone(), self.transport.clone());
            if catch_unwind(AssertUnwindSafe(move || start(call))).is_err() {
                tracing::warn!(call_id = %call_id, "async native call panicked while starting");
            }
        }
    }

    fn dispatch(&self, request: &RequestEnvelope) -> Result<Reply, BridgeError> {
        match request.name.as_str() {
            names::GET_NATIVE_OBJECT => {
                let id = self.registry.lookup(&request.payload)?;
                Ok(Reply::data(id.to_string()))
            }
            names::GET_PROPERTY => {
                let body: PropertyRequest = parse_body(request)?;
                let reply = self.registry.get(body.object_id, &body.name)?;
                Ok(Reply::data(to_body(&reply)?))
            }
            names::SET_PROPERTY => {
                let body: SetPropertyRequest = parse_body(request)?;
                let accepted = self.registry.set(body.object_id, &body.name, &body.value)?;
                Ok(Reply::data(accepted.to_string()))
            }
            names::CALL_METHOD => {
                let body: CallRequest = parse_body(request)?;
                self.apply(body)
            }
            other => Err(BridgeError::Protocol(format!("unknown request '{}'", other))),
        }
    }

    fn apply(&self, body: CallRequest) -> Result<Reply, BridgeError> {
        let not_applicable = || BridgeError::MemberNotApplicable {
            object_id: body.object_id,
            member: body.name.clone(),
        };

        match self.registry.apply(body.object_id, &body.name, &body.args)? {
            ApplyOutcome::Value(data) => Ok(Reply::data(to_body(&CallReply::Value { data })?)),
            ApplyOutcome::Failed(message) => Err(BridgeError::InvocationFailure {
                member: body.name.clone(),
                message,
            }),
            ApplyOutcome::NotApplicable => Err(not_applicable()),
            ApplyOutcome::Pending(start) => match &body.call_id {
                Some(call_id) => Ok(Reply {
                    payload: to_body(&CallReply::Pending)?,
                    deferred: Some((call_id.clone(), start)),
                }),
                // Asynchronous members can only be reached through a promise.
                None => Err(not_applicable()),
            },
        }
    }

    fn handle_message(&self, message: Message) -> Result<(), BridgeError> {
        match message.name.as_str() {
            names::EVALUATION_RESPONSE => {
                let result = EvalResult::from_message(&message)?;
                self.evaluations
                    .complete(result, |data| self.marshaller.marshal(data));
            }
            names::POST_MESSAGE_TO_HOST => {
                let mut reader = message.reader(3)?;
                let host_message = HostMessage {
                    context: ContextId(reader.int()? as u64),
                    frame_id: reader.int()?,
                    json: reader.string()?.to_string(),
                };
                let listener = self.listener.lock().clone();
                match listener {
                    Some(listener) => listener(host_message),
                    None => tracing::debug!(context_id = %host_message.context, "no host message listener"),
                }
            }
            names::CONTEXT_CREATED => {
                let mut reader = message.reader(3)?;
                let context = ContextId(reader.int()? as u64);
                let address = FrameAddress {
                    session_id: reader.int()?,
                    frame_id: reader.int()?,
                };
                tracing::debug!(context_id = %context, frame_id = address.frame_id, "script context created");
                self.contexts.lock().insert(context, address);
            }
            names::CONTEXT_RELEASED => {
                let mut reader = message.reader(1)?;
                let context = ContextId(reader.int()? as u64);
                self.contexts.lock().remove(&context);
                let cancelled = self.evaluations.cancel_context(context);
                tracing::debug!(context_id = %context, cancelled, "script context released");
            }
            other => {
                tracing::warn!(name = other, "ignoring unknown message");
            }
        }
        Ok(())
    }
}

impl FrameHandler for HostBridge {
    fn handle_frame(&self, frame: Frame) {
        if self.is_shut_down() {
            return;
        }
        match frame {
            Frame::Request(request) => self.handle_request(request),
            Frame::Message(message) => {
                let name = message.name.clone();
                if let Err(err) = self.handle_message(message) {
                    tracing::warn!(name = %name, error = %err, "dropping malformed message");
                }
            }
            Frame::Response(response) => {
                tracing::warn!(request_id = response.request_id, "host received an unexpected response");
            }
        }
    }
}

impl Drop for HostBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_body<T: DeserializeOwned>(request: &RequestEnvelope) -> Result<T, BridgeError> {
    serde_json::from_str(&request.payload)
        .map_err(|e| BridgeError::Protocol(format!("malformed '{}' payload: {}", request.name, e)))
}

fn to_body<T: serde::Serialize>(body: &T) -> Result<String, BridgeError> {
    serde_json::to_string(body).map_err(|e| BridgeError::Protocol(e.to_string()))
}
