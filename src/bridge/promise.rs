//! Asynchronous native calls surfaced to script as promises.
//!
//! The script side registers a [`ScriptPromise`] under a fresh call ID before
//! the call leaves the process. The host hands the native function an
//! [`AsyncCall`] carrying the same ID; whenever the function finishes, from
//! whatever thread, the settlement travels back as a fire-and-forget message
//! and is re-entered on the queue of the context that created the promise.
//!
//! Per call: `Pending -> Resolved | Rejected`, or `Pending -> released` when
//! the owning context goes away first, which rejects with
//! [`BridgeError::ContextReleased`].

use crate::bridge::channel::Transport;
use crate::bridge::codec::{names, Frame, Message};
use crate::bridge::context::{ContextId, ScriptContext};
use crate::bridge::error::BridgeError;
use crate::bridge::js_value::JSValue;
use crate::bridge::marshal::Marshaller;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use uuid::Uuid;

const DROPPED_REASON: &str = "[Bridge] native call dropped without result";

/// Host-side handle used by an asynchronous native function to settle the
/// script promise waiting for it. Consumed by [`resolve`](Self::resolve) or
/// [`reject`](Self::reject); dropping it unsettled rejects the promise.
pub struct AsyncCall {
    call_id: String,
    transport: Arc<dyn Transport>,
    settled: bool,
}

impl std::fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCall")
            .field("call_id", &self.call_id)
            .field("settled", &self.settled)
            .finish()
    }
}

impl AsyncCall {
    pub(crate) fn new(call_id: String, transport: Arc<dyn Transport>) -> Self {
        Self {
            call_id,
            transport,
            settled: false,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Fulfil the promise with a JSON payload.
    pub fn resolve(mut self, json: impl Into<String>) {
        self.settle(true, json.into());
    }

    /// Reject the promise; `reason` becomes the script-visible error message.
    pub fn reject(mut self, reason: impl Into<String>) {
        self.settle(false, reason.into());
    }

    fn settle(&mut self, success: bool, payload: String) {
        self.settled = true;
        let message = Message::new(names::SETTLE_PROMISE)
            .string(self.call_id.as_str())
            .boolean(success)
            .string(payload);
        if let Err(err) = self.transport.send(Frame::Message(message)) {
            tracing::warn!(call_id = %self.call_id, error = %err, "failed to send promise settlement");
        }
    }
}

impl Drop for AsyncCall {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(call_id = %self.call_id, "async call dropped unsettled");
            self.settle(false, DROPPED_REASON.to_string());
        }
    }
}

type Settlement = Result<JSValue, BridgeError>;

/// Script-visible promise of an asynchronous native call.
///
/// Awaitable; [`wait`](Self::wait) blocks the current thread instead.
pub struct ScriptPromise {
    call_id: OnceCell<String>,
    context: ContextId,
    rx: oneshot::Receiver<Settlement>,
    // Filled once the receiver yields; the receiver is never touched again.
    settled: Option<Settlement>,
}

impl std::fmt::Debug for ScriptPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptPromise")
            .field("call_id", &self.call_id.get())
            .field("context", &self.context)
            .finish()
    }
}

impl ScriptPromise {
    fn new(context: ContextId, rx: oneshot::Receiver<Settlement>) -> Self {
        Self {
            call_id: OnceCell::new(),
            context,
            rx,
            settled: None,
        }
    }

    /// Correlation ID; assigned on first access and stable afterwards.
    pub fn call_id(&self) -> &str {
        self.call_id.get_or_init(|| Uuid::new_v4().to_string())
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Settlement if it already happened, without waiting. May be asked any
    /// number of times; every answer after the first is the same.
    pub fn try_result(&mut self) -> Option<Settlement> {
        if self.settled.is_none() {
            let settlement = match self.rx.try_recv() {
                Ok(settlement) => settlement,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    Err(BridgeError::ContextReleased(self.context))
                }
            };
            self.settled = Some(settlement);
        }
        self.settled.clone()
    }

    /// Block until settled. Never call this from the owning context's queue,
    /// which is where the settlement has to run.
    pub fn wait(self) -> Settlement {
        futures::executor::block_on(self)
    }
}

impl Future for ScriptPromise {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(settlement) = self.settled.clone() {
            return Poll::Ready(settlement);
        }
        let context = self.context;
        let settlement = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(settlement)) => settlement,
            Poll::Ready(Err(_)) => Err(BridgeError::ContextReleased(context)),
            Poll::Pending => return Poll::Pending,
        };
        self.settled = Some(settlement.clone());
        Poll::Ready(settlement)
    }
}

struct PendingPromise {
    context: ScriptContext,
    settle: oneshot::Sender<Settlement>,
}

/// Script-side table of outstanding asynchronous calls.
pub struct PromiseBridge {
    pending: Mutex<HashMap<String, PendingPromise>>,
    marshaller: Marshaller,
}

impl PromiseBridge {
    pub fn new(marshaller: Marshaller) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            marshaller,
        }
    }

    /// Create a pending promise owned by `context`.
    pub fn begin(&self, context: &ScriptContext) -> Result<ScriptPromise, BridgeError> {
        if context.is_released() {
            return Err(BridgeError::ContextReleased(context.id()));
        }
        let (tx, rx) = oneshot::channel();
        let promise = ScriptPromise::new(context.id(), rx);
        let call_id = promise.call_id().to_string();

        match self.pending.lock().entry(call_id) {
            Entry::Occupied(entry) => {
                tracing::error!(call_id = %entry.key(), "promise call id already pending");
                Err(BridgeError::Protocol(format!(
                    "promise {} is already pending",
                    entry.key()
                )))
            }
            Entry::Vacant(entry) => {
                tracing::trace!(call_id = %entry.key(), context_id = %context.id(), "promise pending");
                entry.insert(PendingPromise {
                    context: context.clone(),
                    settle: tx,
                });
                Ok(promise)
            }
        }
    }

    pub fn resolve(&self, call_id: &str, json: &str) -> bool {
        self.settle(call_id, true, json)
    }

    pub fn reject(&self, call_id: &str, reason: &str) -> bool {
        self.settle(call_id, false, reason)
    }

    /// Settle a pending promise on its own context's queue.
    ///
    /// Returns false when nothing was waiting for `call_id`.
    pub fn settle(&self, call_id: &str, success: bool, payload: &str) -> bool {
        let Some(pending) = self.pending.lock().remove(call_id) else {
            tracing::warn!(call_id, "discarding settlement for unknown promise");
            return false;
        };

        let marshaller = self.marshaller.clone();
        let payload = payload.to_string();
        let PendingPromise { context, settle } = pending;
        let posted = context.post(move || {
            let settlement = if success {
                Ok(marshaller.marshal(&payload))
            } else if payload.starts_with("[Bridge] ") {
                Err(BridgeError::remote(Some(payload)))
            } else {
                Err(BridgeError::remote(Some(format!("[Bridge] {}", payload))))
            };
            let _ = settle.send(settlement);
        });
        // A refused task drops its sender, so the promise sees the release.
        if let Err(err) = posted {
            tracing::debug!(call_id, error = %err, "settlement arrived after context release");
        }
        true
    }

    /// Reject with a bridge error, e.g. when the call itself failed.
    pub fn fail(&self, call_id: &str, error: BridgeError) -> bool {
        let Some(PendingPromise { context, settle }) = self.pending.lock().remove(call_id) else {
            // Already settled or released with its context.
            tracing::trace!(call_id, "no pending promise to fail");
            return false;
        };
        let posted = context.post(move || {
            let _ = settle.send(Err(error));
        });
        if let Err(err) = posted {
            tracing::debug!(call_id, error = %err, "failure arrived after context release");
        }
        true
    }

    /// Reject every promise owned by `context`. Others are left alone.
    pub fn release_context(&self, context: ContextId) -> usize {
        let released: Vec<PendingPromise> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.context.id() == context)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = released.len();
        for pending in released {
            let _ = pending.settle.send(Err(BridgeError::ContextReleased(context)));
        }
        if count > 0 {
            tracing::debug!(context_id = %context, count, "rejected pending promises");
        }
        count
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.pending.lock().contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
