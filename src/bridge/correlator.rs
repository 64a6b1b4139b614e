//! Request/response correlation on top of the fire-and-forget channel.
//!
//! A blocking [`Correlator::call`] parks the calling script thread on a
//! single-use completion slot. The reply is delivered by the channel's
//! dispatch thread through [`Correlator::deliver`], never by the thread that
//! waits, so a context cannot deadlock against its own response. Releasing
//! the caller's context completes the slot with a cancellation.

use crate::bridge::channel::Transport;
use crate::bridge::codec::{Frame, RequestEnvelope, ResponseEnvelope};
use crate::bridge::context::{ContextId, FrameAddress};
use crate::bridge::error::BridgeError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Outcome handed to whoever waits on a request.
pub type CallResult = Result<String, BridgeError>;

/// Completion slot of a pending request.
pub enum Responder {
    /// A script thread blocked in [`Correlator::call`].
    Blocking(mpsc::SyncSender<CallResult>),
    /// An async waiter.
    Async(oneshot::Sender<CallResult>),
    /// Run on the delivering thread; nobody waits.
    Callback(Box<dyn FnOnce(CallResult) + Send + 'static>),
}

impl Responder {
    fn complete(self, result: CallResult) {
        match self {
            Responder::Blocking(tx) => {
                let _ = tx.try_send(result);
            }
            Responder::Async(tx) => {
                let _ = tx.send(result);
            }
            Responder::Callback(callback) => callback(result),
        }
    }
}

struct PendingRequest {
    context: ContextId,
    name: String,
    responder: Responder,
}

pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    timeout: Option<Duration>,
}

impl Correlator {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a pending request and send it. Returns the request ID.
    pub fn submit(
        &self,
        transport: &dyn Transport,
        context: ContextId,
        address: FrameAddress,
        name: &str,
        payload: String,
        responder: Responder,
    ) -> Result<u64, BridgeError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                tracing::error!(request_id, "request id already pending");
                return Err(BridgeError::Protocol(format!(
                    "request {} is already pending",
                    request_id
                )));
            }
            pending.insert(
                request_id,
                PendingRequest {
                    context,
                    name: name.to_string(),
                    responder,
                },
            );
        }

        let envelope = RequestEnvelope {
            request_id,
            name: name.to_string(),
            address,
            payload,
        };
        tracing::trace!(request_id, name, context_id = %context, "sending request");

        if let Err(err) = transport.send(Frame::Request(envelope)) {
            self.pending.lock().remove(&request_id);
            return Err(err);
        }
        Ok(request_id)
    }

    /// Send a request and block until its response, the configured timeout,
    /// or the release of `context`.
    pub fn call(
        &self,
        transport: &dyn Transport,
        context: ContextId,
        address: FrameAddress,
        name: &str,
        payload: String,
    ) -> CallResult {
        let (tx, rx) = mpsc::sync_channel(1);
        let request_id = self.submit(
            transport,
            context,
            address,
            name,
            payload,
            Responder::Blocking(tx),
        )?;

        let received = match self.timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => BridgeError::Timeout {
                    name: name.to_string(),
                    timeout,
                },
                mpsc::RecvTimeoutError::Disconnected => BridgeError::ChannelClosed,
            }),
            None => rx.recv().map_err(|_| BridgeError::ChannelClosed),
        };

        match received {
            Ok(result) => result,
            Err(err) => {
                // Whatever arrives later for this ID is discarded by deliver().
                self.pending.lock().remove(&request_id);
                tracing::warn!(request_id, name, error = %err, "request abandoned");
                Err(err)
            }
        }
    }

    /// Send a request and await its response.
    pub async fn call_async(
        &self,
        transport: &dyn Transport,
        context: ContextId,
        address: FrameAddress,
        name: &str,
        payload: String,
    ) -> CallResult {
        let (tx, rx) = oneshot::channel();
        self.submit(transport, context, address, name, payload, Responder::Async(tx))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::ContextReleased(context)),
        }
    }

    /// Route a response to its waiter. The pending entry is removed on first
    /// delivery; any later delivery for the same ID is discarded.
    pub fn deliver(&self, response: ResponseEnvelope) -> bool {
        let Some(pending) = self.pending.lock().remove(&response.request_id) else {
            tracing::warn!(
                request_id = response.request_id,
                name = %response.name,
                "discarding response for unknown or already completed request"
            );
            return false;
        };

        if pending.name != response.name {
            tracing::warn!(
                request_id = response.request_id,
                expected = %pending.name,
                got = %response.name,
                "response name does not match its request"
            );
        }

        let result = if response.success {
            Ok(response.payload)
        } else {
            Err(BridgeError::remote(response.error_message))
        };
        pending.responder.complete(result);
        true
    }

    /// Fail every request issued from `context`.
    pub fn cancel_context(&self, context: ContextId) -> usize {
        let cancelled: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.context == context)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let count = cancelled.len();
        for pending in cancelled {
            pending
                .responder
                .complete(Err(BridgeError::ContextReleased(context)));
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
