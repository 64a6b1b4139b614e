//! Script execution contexts and their task queues.
//!
//! Each context runs its tasks one at a time on a dedicated thread. Anything
//! that touches script values for a context (promise settlement, remote
//! evaluation, message delivery) is posted to that context's queue instead of
//! running on whichever thread produced it.

use crate::bridge::error::{panic_message, BridgeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifier of a script execution context, unique per script facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addressing carried by every request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameAddress {
    pub session_id: i64,
    pub frame_id: i64,
}

/// Work item executed on a context's queue.
pub type ContextTask = Box<dyn FnOnce() + Send + 'static>;

/// Sender half of a context's single-threaded task queue.
#[derive(Clone)]
pub struct ContextQueue {
    tx: mpsc::UnboundedSender<ContextTask>,
}

impl ContextQueue {
    /// Spawn the thread serving a new queue.
    pub fn spawn(thread_name: String) -> Result<Self, BridgeError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ContextTask>();

        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        tracing::error!(thread = %thread_name, error = %err, "failed to build context runtime");
                        return;
                    }
                };

                let name = thread_name.as_str();
                tokio_rt.block_on(async move {
                    while let Some(task) = rx.recv().await {
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                            tracing::error!(
                                thread = %name,
                                panic = %panic_message(panic.as_ref()),
                                "context task panicked"
                            );
                        }
                    }
                });
                tracing::trace!(thread = %thread_name, "context queue drained");
            })
            .map_err(|e| BridgeError::Config(format!("Failed to spawn context thread: {}", e)))?;

        Ok(Self { tx })
    }

    /// Queue a task; fails once the queue has been closed.
    pub fn post(&self, task: ContextTask) -> Result<(), BridgeError> {
        self.tx.send(task).map_err(|_| BridgeError::ChannelClosed)
    }
}

struct ContextInner {
    id: ContextId,
    address: FrameAddress,
    queue: ContextQueue,
    released: AtomicBool,
}

/// Handle to a live script execution context.
#[derive(Clone)]
pub struct ScriptContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ScriptContext {
    pub(crate) fn new(id: ContextId, address: FrameAddress, queue: ContextQueue) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                address,
                queue,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn address(&self) -> FrameAddress {
        self.inner.address
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Run `task` on this context's queue.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<(), BridgeError> {
        if self.is_released() {
            return Err(BridgeError::ContextReleased(self.id()));
        }
        self.inner
            .queue
            .post(Box::new(task))
            .map_err(|_| BridgeError::ContextReleased(self.id()))
    }

    pub fn queue(&self) -> &ContextQueue {
        &self.inner.queue
    }

    /// Mark released; returns false if it already was.
    pub(crate) fn mark_released(&self) -> bool {
        !self.inner.released.swap(true, Ordering::AcqRel)
    }
}
