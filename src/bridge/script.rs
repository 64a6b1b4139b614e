//! Script-process facade.
//!
//! Creates and releases execution contexts, forwards proxy access to the host
//! through the correlator, runs remote evaluations on the target context's
//! queue and settles promises of asynchronous native calls.
//!
//! The blocking accessors (`get_native_object`, `get_property`,
//! `set_property`, `call_function`) may be called from a context's own queue:
//! their responses are delivered on the endpoint's dispatch thread.

use crate::bridge::channel::{FrameHandler, LocalEndpoint, Transport};
use crate::bridge::codec::{names, Frame, Message, ResponseEnvelope};
use crate::bridge::config::BridgeConfig;
use crate::bridge::context::{ContextId, ContextQueue, FrameAddress, ScriptContext};
use crate::bridge::correlator::{Correlator, Responder};
use crate::bridge::engine::{engine_parser, ScriptEngine};
use crate::bridge::error::{panic_message, BridgeError};
use crate::bridge::evaluation::{EvalRequest, EvalResult, ExceptionDetail};
use crate::bridge::js_value::JSValue;
use crate::bridge::marshal::Marshaller;
use crate::bridge::promise::{PromiseBridge, ScriptPromise};
use crate::bridge::registry::{CallReply, CallRequest, PropertyReply, PropertyRequest, SetPropertyRequest};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Message posted by the host to a script context.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMessage {
    pub context: ContextId,
    pub value: JSValue,
}

pub type ScriptListener = Arc<dyn Fn(ScriptMessage) + Send + Sync>;

pub struct ScriptBridge {
    config: BridgeConfig,
    transport: Arc<dyn Transport>,
    engine: Arc<dyn ScriptEngine>,
    marshaller: Marshaller,
    correlator: Correlator,
    promises: Arc<PromiseBridge>,
    contexts: Mutex<HashMap<ContextId, ScriptContext>>,
    next_context: AtomicU64,
    listener: Mutex<Option<ScriptListener>>,
    shut_down: AtomicBool,
}

impl ScriptBridge {
    /// Build a script facade sending through `transport`. Inbound frames must
    /// be fed to [`FrameHandler::handle_frame`] by the caller.
    pub fn new(
        config: BridgeConfig,
        engine: Arc<dyn ScriptEngine>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, BridgeError> {
        config.validate()?;
        let marshaller = Marshaller::with_parser(config.max_unwrap_depth, engine_parser(engine.clone()));
        Ok(Arc::new(Self {
            correlator: Correlator::new(config.call_timeout),
            promises: Arc::new(PromiseBridge::new(marshaller.clone())),
            marshaller,
            config,
            transport,
            engine,
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
            listener: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Build a script facade on a local endpoint and start its dispatch thread.
    pub fn connect(
        config: BridgeConfig,
        engine: Arc<dyn ScriptEngine>,
        endpoint: Arc<LocalEndpoint>,
    ) -> Result<Arc<Self>, BridgeError> {
        let thread_name = config.thread_label("script");
        let bridge = Self::new(config, engine, endpoint.clone())?;
        let handler: Arc<dyn FrameHandler> = bridge.clone();
        endpoint.start(thread_name, Arc::downgrade(&handler))?;
        Ok(bridge)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn marshaller(&self) -> &Marshaller {
        &self.marshaller
    }

    /// Create an execution context for `frame_id` and announce it to the host.
    pub fn create_context(&self, frame_id: i64) -> Result<ScriptContext, BridgeError> {
        if self.is_shut_down() {
            return Err(BridgeError::ChannelClosed);
        }
        let id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        let address = FrameAddress {
            session_id: self.config.session_id,
            frame_id,
        };
        let queue = ContextQueue::spawn(self.config.thread_label(&format!("context-{}", id)))?;
        let context = ScriptContext::new(id, address, queue);
        self.contexts.lock().insert(id, context.clone());

        let announce = Message::new(names::CONTEXT_CREATED)
            .int(id.0 as i64)
            .int(address.session_id)
            .int(address.frame_id);
        self.transport.send(Frame::Message(announce))?;
        tracing::debug!(context_id = %id, frame_id, "created script context");
        Ok(context)
    }

    pub fn context(&self, id: ContextId) -> Option<ScriptContext> {
        self.contexts.lock().get(&id).cloned()
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.contexts.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Release a context. Every call and promise it still has pending is
    /// settled with [`BridgeError::ContextReleased`]. Returns false if the
    /// context was unknown.
    pub fn release_context(&self, id: ContextId) -> bool {
        let Some(context) = self.contexts.lock().remove(&id) else {
            return false;
        };
        context.mark_released();
        let promises = self.promises.release_context(id);
        let requests = self.correlator.cancel_context(id);

        let notice = Message::new(names::CONTEXT_RELEASED).int(id.0 as i64);
        if let Err(err) = self.transport.send(Frame::Message(notice)) {
            tracing::debug!(context_id = %id, error = %err, "could not announce context release");
        }
        tracing::debug!(context_id = %id, promises, requests, "released script context");
        true
    }

    /// Resolve a host object registered under `name`.
    pub fn get_native_object(&self, context: &ScriptContext, name: &str) -> Result<JSValue, BridgeError> {
        let payload = self.request(context, names::GET_NATIVE_OBJECT, name.to_string())?;
        let id = payload
            .trim()
            .parse::<i64>()
            .map_err(|_| BridgeError::Protocol(format!("invalid object handle '{}'", payload)))?;
        Ok(JSValue::NativeObject { id })
    }

    /// Read a property. Functions come back as [`JSValue::NativeFunction`]
    /// and nested objects as [`JSValue::NativeObject`].
    pub fn get_property(&self, context: &ScriptContext, object_id: i64, name: &str) -> Result<JSValue, BridgeError> {
        let body = to_body(&PropertyRequest {
            object_id,
            name: name.to_string(),
        })?;
        let reply: PropertyReply = parse_reply(&self.request(context, names::GET_PROPERTY, body)?)?;
        Ok(match reply {
            PropertyReply::Value { data } => self.marshaller.marshal(&data),
            PropertyReply::Function { asynchronous } => JSValue::NativeFunction {
                object_id,
                name: name.to_string(),
                asynchronous,
            },
            PropertyReply::Object { id } => JSValue::NativeObject { id },
            PropertyReply::Undefined => JSValue::Undefined,
        })
    }

    /// Write a property; false when the host refused it.
    pub fn set_property(
        &self,
        context: &ScriptContext,
        object_id: i64,
        name: &str,
        json: &str,
    ) -> Result<bool, BridgeError> {
        let body = to_body(&SetPropertyRequest {
            object_id,
            name: name.to_string(),
            value: json.to_string(),
        })?;
        parse_reply(&self.request(context, names::SET_PROPERTY, body)?)
    }

    /// Call a synchronous native function with JSON-encoded arguments.
    pub fn call_function(
        &self,
        context: &ScriptContext,
        object_id: i64,
        name: &str,
        args: &str,
    ) -> Result<JSValue, BridgeError> {
        let body = to_body(&CallRequest {
            object_id,
            name: name.to_string(),
            args: args.to_string(),
            call_id: None,
        })?;
        match parse_reply(&self.request(context, names::CALL_METHOD, body)?)? {
            CallReply::Value { data } => Ok(self.marshaller.marshal(&data)),
            CallReply::Pending => Err(BridgeError::Protocol(format!(
                "synchronous call '{}' answered as pending",
                name
            ))),
        }
    }

    /// Call a native function and return a promise for its result without
    /// blocking. Synchronous members settle the promise right away.
    pub fn begin_async_call(
        &self,
        context: &ScriptContext,
        object_id: i64,
        name: &str,
        args: &str,
    ) -> Result<ScriptPromise, BridgeError> {
        self.ensure_live(context)?;
        let promise = self.promises.begin(context)?;
        let call_id = promise.call_id().to_string();
        let body = to_body(&CallRequest {
            object_id,
            name: name.to_string(),
            args: args.to_string(),
            call_id: Some(call_id.clone()),
        })?;

        let promises = self.promises.clone();
        let reply_call_id = call_id.clone();
        let responder = Responder::Callback(Box::new(move |result| {
            let call_id = reply_call_id;
            match result.and_then(|payload| parse_reply::<CallReply>(&payload)) {
                Ok(CallReply::Value { data }) => {
                    promises.resolve(&call_id, &data);
                }
                Ok(CallReply::Pending) => {
                    tracing::trace!(call_id = %call_id, "native call pending");
                }
                Err(err) => {
                    promises.fail(&call_id, err);
                }
            }
        }));

        if let Err(err) = self.correlator.submit(
            self.transport.as_ref(),
            context.id(),
            context.address(),
            names::CALL_METHOD,
            body,
            responder,
        ) {
            self.promises.fail(&call_id, err.clone());
            return Err(err);
        }
        Ok(promise)
    }

    /// Post a JSON payload to the host's message listener.
    pub fn post_message_to_host(&self, context: &ScriptContext, json: &str) -> Result<(), BridgeError> {
        self.ensure_live(context)?;
        let message = Message::new(names::POST_MESSAGE_TO_HOST)
            .int(context.id().0 as i64)
            .int(context.address().frame_id)
            .string(json);
        self.transport.send(Frame::Message(message))
    }

    /// Install the listener for messages posted by the host. It runs on the
    /// target context's queue.
    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(ScriptMessage) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    pub fn pending_promises(&self) -> usize {
        self.promises.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Release every context and close the channel. Safe to call twice.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for id in self.contexts() {
            self.release_context(id);
        }
        self.listener.lock().take();
        self.transport.close();
        tracing::debug!(session_id = self.config.session_id, "script bridge shut down");
    }

    fn ensure_live(&self, context: &ScriptContext) -> Result<(), BridgeError> {
        if self.is_shut_down() {
            return Err(BridgeError::ChannelClosed);
        }
        if context.is_released() {
            return Err(BridgeError::ContextReleased(context.id()));
        }
        Ok(())
    }

    fn request(&self, context: &ScriptContext, name: &str, payload: String) -> Result<String, BridgeError> {
        self.ensure_live(context)?;
        self.correlator.call(
            self.transport.as_ref(),
            context.id(),
            context.address(),
            name,
            payload,
        )
    }

    fn evaluate(&self, request: EvalRequest) {
        let task_id = request.task_id;
        let Some(context) = self.context(request.context) else {
            tracing::debug!(task_id, context_id = %request.context, "evaluation for unknown context");
            self.send_eval_result(failed_evaluation(task_id, request.context));
            return;
        };

        let engine = self.engine.clone();
        let transport = self.transport.clone();
        let target = context.clone();
        let posted = context.post(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| engine.evaluate(&target, &request)))
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(task_id, context_id = %target.id(), panic = %message, "script engine panicked");
                    Err(ExceptionDetail {
                        message: format!("[Bridge] script engine panicked: {}", message),
                        line_number: request.line,
                        resource_name: request.url.clone(),
                        ..ExceptionDetail::default()
                    })
                });
            let result = match outcome {
                Ok(data) => EvalResult {
                    task_id,
                    success: true,
                    data,
                    value: None,
                    exception: None,
                },
                Err(exception) => EvalResult {
                    task_id,
                    success: false,
                    data: String::new(),
                    value: None,
                    exception: Some(exception),
                },
            };
            if let Err(err) = transport.send(Frame::Message(result.to_message())) {
                tracing::warn!(task_id, error = %err, "failed to send evaluation result");
            }
        });
        if posted.is_err() {
            self.send_eval_result(failed_evaluation(task_id, context.id()));
        }
    }

    fn send_eval_result(&self, result: EvalResult) {
        if let Err(err) = self.transport.send(Frame::Message(result.to_message())) {
            tracing::warn!(task_id = result.task_id, error = %err, "failed to send evaluation result");
        }
    }

    fn deliver_to_script(&self, context_id: ContextId, payload: String, as_json: bool) {
        let Some(context) = self.context(context_id) else {
            tracing::debug!(context_id = %context_id, "message for unknown context dropped");
            return;
        };
        let Some(listener) = self.listener.lock().clone() else {
            tracing::debug!(context_id = %context_id, "no script message listener");
            return;
        };
        let marshaller = self.marshaller.clone();
        let posted = context.post(move || {
            let value = if as_json {
                marshaller.marshal(&payload)
            } else {
                JSValue::String(payload)
            };
            listener(ScriptMessage {
                context: context_id,
                value,
            });
        });
        if let Err(err) = posted {
            tracing::debug!(context_id = %context_id, error = %err, "message dropped");
        }
    }

    fn handle_message(&self, message: Message) -> Result<(), BridgeError> {
        match message.name.as_str() {
            names::EVALUATION_REQUEST => {
                self.evaluate(EvalRequest::from_message(&message)?);
            }
            names::SETTLE_PROMISE => {
                let mut reader = message.reader(3)?;
                let call_id = reader.string()?;
                let success = reader.boolean()?;
                let payload = reader.string()?;
                self.promises.settle(call_id, success, payload);
            }
            names::POST_MESSAGE_TO_SCRIPT => {
                let mut reader = message.reader(3)?;
                let context = ContextId(reader.int()? as u64);
                let payload = reader.string()?.to_string();
                let as_json = reader.boolean()?;
                self.deliver_to_script(context, payload, as_json);
            }
            other => {
                tracing::warn!(name = other, "ignoring unknown message");
            }
        }
        Ok(())
    }
}

impl FrameHandler for ScriptBridge {
    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response(response) => {
                self.correlator.deliver(response);
            }
            Frame::Message(message) => {
                let name = message.name.clone();
                if let Err(err) = self.handle_message(message) {
                    tracing::warn!(name = %name, error = %err, "dropping malformed message");
                }
            }
            Frame::Request(request) => {
                tracing::warn!(request_id = request.request_id, name = %request.name, "script process serves no requests");
                let refusal = ResponseEnvelope::failure(
                    &request,
                    BridgeError::Protocol(format!("unknown request '{}'", request.name)).to_string(),
                );
                let _ = self.transport.send(Frame::Response(refusal));
            }
        }
    }
}

impl Drop for ScriptBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn failed_evaluation(task_id: i64, context: ContextId) -> EvalResult {
    EvalResult {
        task_id,
        success: false,
        data: String::new(),
        value: None,
        exception: Some(ExceptionDetail::new(
            BridgeError::ContextReleased(context).to_string(),
        )),
    }
}

fn parse_reply<T: DeserializeOwned>(payload: &str) -> Result<T, BridgeError> {
    serde_json::from_str(payload).map_err(|e| BridgeError::Protocol(format!("malformed reply: {}", e)))
}

fn to_body<T: serde::Serialize>(body: &T) -> Result<String, BridgeError> {
    serde_json::to_string(body).map_err(|e| BridgeError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::TestEngine;

    #[derive(Default)]
    struct CapturingTransport {
        frames: Mutex<Vec<Frame>>,
    }

    impl CapturingTransport {
        fn messages(&self) -> Vec<Message> {
            self.frames
                .lock()
                .iter()
                .filter_map(|f| match f {
                    Frame::Message(m) => Some(m.clone()),
                    _ => None,
                })
                .collect()
        }

        fn wait_for_message(&self, name: &str) -> Message {
            for _ in 0..500 {
                if let Some(message) = self.messages().into_iter().find(|m| m.name == name) {
                    return message;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            panic!("no '{}' message was sent", name);
        }
    }

    impl Transport for CapturingTransport {
        fn send(&self, frame: Frame) -> Result<(), BridgeError> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    fn script() -> (Arc<ScriptBridge>, Arc<CapturingTransport>) {
        let transport = Arc::new(CapturingTransport::default());
        let bridge = ScriptBridge::new(
            BridgeConfig::default().with_thread_name("jsbridge-test-script"),
            Arc::new(TestEngine),
            transport.clone(),
        )
        .unwrap();
        (bridge, transport)
    }

    #[test]
    fn test_context_lifecycle_is_announced() {
        let (bridge, transport) = script();
        let a = bridge.create_context(10).unwrap();
        let b = bridge.create_context(11).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(bridge.contexts(), vec![a.id(), b.id()]);

        assert!(bridge.release_context(a.id()));
        assert!(!bridge.release_context(a.id()));
        assert!(a.is_released());

        let names: Vec<String> = transport.messages().into_iter().map(|m| m.name).collect();
        assert_eq!(
            names,
            vec![
                names::CONTEXT_CREATED.to_string(),
                names::CONTEXT_CREATED.to_string(),
                names::CONTEXT_RELEASED.to_string(),
            ]
        );
    }

    #[test]
    fn test_evaluation_runs_on_the_context() {
        let (bridge, transport) = script();
        let context = bridge.create_context(1).unwrap();
        let request = EvalRequest {
            task_id: 3,
            context: context.id(),
            source: "1+1".to_string(),
            url: "about:blank".to_string(),
            line: 1,
        };
        bridge.handle_frame(Frame::Message(request.to_message()));

        let reply = transport.wait_for_message(names::EVALUATION_RESPONSE);
        let result = EvalResult::from_message(&reply).unwrap();
        assert_eq!(result.task_id, 3);
        assert!(result.success);
        assert_eq!(result.data, "2");
    }

    #[test]
    fn test_evaluation_for_unknown_context_fails_fast() {
        let (bridge, transport) = script();
        let request = EvalRequest {
            task_id: 8,
            context: ContextId(42),
            source: "1".to_string(),
            url: String::new(),
            line: 1,
        };
        bridge.handle_frame(Frame::Message(request.to_message()));

        let result = EvalResult::from_message(&transport.wait_for_message(names::EVALUATION_RESPONSE)).unwrap();
        assert!(!result.success);
        assert!(result.exception.unwrap().message.starts_with("[Bridge] "));
    }

    #[test]
    fn test_released_context_refuses_calls() {
        let (bridge, _transport) = script();
        let context = bridge.create_context(1).unwrap();
        bridge.release_context(context.id());

        assert!(matches!(
            bridge.get_native_object(&context, "math"),
            Err(BridgeError::ContextReleased(_))
        ));
        assert!(bridge.begin_async_call(&context, 1, "f", "[]").is_err());
        assert_eq!(bridge.pending_promises(), 0);
    }

    #[test]
    fn test_release_settles_pending_promises() {
        let (bridge, _transport) = script();
        let context = bridge.create_context(1).unwrap();
        let promises: Vec<ScriptPromise> = (0..4)
            .map(|_| bridge.begin_async_call(&context, 1, "slow", "[]").unwrap())
            .collect();
        assert_eq!(bridge.pending_promises(), 4);
        assert_eq!(bridge.pending_requests(), 4);

        bridge.release_context(context.id());
        for promise in promises {
            assert!(promise.wait().unwrap_err().is_cancellation());
        }
        assert_eq!(bridge.pending_promises(), 0);
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (bridge, _transport) = script();
        bridge.create_context(1).unwrap();
        bridge.shutdown();
        bridge.shutdown();
        assert!(bridge.contexts().is_empty());
        assert!(matches!(bridge.create_context(2), Err(BridgeError::ChannelClosed)));
    }
}
