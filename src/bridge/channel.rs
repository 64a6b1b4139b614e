//! Message-passing channel between the host and script processes.
//!
//! The bridge only needs [`Transport::send`] and an inbound dispatch path that
//! hands decoded frames to a [`FrameHandler`]. [`LocalChannel`] provides both
//! in-process: each endpoint owns a dispatch thread with a single-threaded
//! Tokio runtime, standing in for the channel's own IPC thread.

use crate::bridge::codec::{decode_frame, encode_frame, Frame};
use crate::bridge::error::BridgeError;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound half of the channel.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, frame: Frame) -> Result<(), BridgeError>;

    /// Stop the channel. Later sends fail with [`BridgeError::ChannelClosed`].
    fn close(&self) {}
}

/// Receiver of inbound frames, called on the channel's dispatch thread.
pub trait FrameHandler: Send + Sync + 'static {
    fn handle_frame(&self, frame: Frame);
}

/// Factory for connected in-process endpoints.
pub struct LocalChannel;

impl LocalChannel {
    /// Create two endpoints; frames sent on one are dispatched by the other.
    pub fn pair() -> (Arc<LocalEndpoint>, Arc<LocalEndpoint>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(LocalEndpoint::new(b_tx, a_rx));
        let b = Arc::new(LocalEndpoint::new(a_tx, b_rx));
        (a, b)
    }
}

/// One side of a [`LocalChannel`].
pub struct LocalEndpoint {
    peer: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl LocalEndpoint {
    fn new(peer: mpsc::UnboundedSender<Vec<u8>>, inbound: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            peer,
            inbound: Mutex::new(Some(inbound)),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the dispatch thread. Can only be called once per endpoint.
    pub fn start(
        &self,
        thread_name: String,
        handler: Weak<dyn FrameHandler>,
    ) -> Result<(), BridgeError> {
        let mut rx = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| BridgeError::Protocol("endpoint already started".to_string()))?;
        let cancel = self.cancel.clone();

        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        tracing::error!(thread = %thread_name, error = %err, "failed to build dispatch runtime");
                        return;
                    }
                };

                tokio_rt.block_on(async move {
                    loop {
                        let bytes = tokio::select! {
                            _ = cancel.cancelled() => break,
                            next = rx.recv() => match next {
                                Some(bytes) => bytes,
                                None => break,
                            },
                        };

                        let frame = match decode_frame(&bytes) {
                            Ok(frame) => frame,
                            Err(err) => {
                                tracing::warn!(error = %err, "dropping undecodable frame");
                                continue;
                            }
                        };

                        match handler.upgrade() {
                            Some(handler) => handler.handle_frame(frame),
                            None => break,
                        }
                    }
                });
                tracing::trace!(thread = %thread_name, "dispatch thread stopped");
            })
            .map_err(|e| BridgeError::Config(format!("Failed to spawn dispatch thread: {}", e)))?;

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.peer.is_closed()
    }

    /// Push raw bytes to the peer, bypassing the encoder.
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), BridgeError> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::ChannelClosed);
        }
        self.peer.send(bytes).map_err(|_| BridgeError::ChannelClosed)
    }
}

impl Transport for LocalEndpoint {
    fn send(&self, frame: Frame) -> Result<(), BridgeError> {
        let bytes = encode_frame(&frame)?;
        self.send_raw(bytes)
    }

    /// Stops dispatching inbound frames as well.
    fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::Message;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct Recorder {
        tx: Mutex<std_mpsc::Sender<(Frame, Option<String>)>>,
    }

    impl FrameHandler for Recorder {
        fn handle_frame(&self, frame: Frame) {
            let thread = std::thread::current().name().map(str::to_string);
            let _ = self.tx.lock().send((frame, thread));
        }
    }

    #[test]
    fn test_frames_are_dispatched_on_the_peer_thread() {
        let (a, b) = LocalChannel::pair();
        let (tx, rx) = std_mpsc::channel();
        let recorder: Arc<dyn FrameHandler> = Arc::new(Recorder { tx: Mutex::new(tx) });
        b.start("jsbridge-test-dispatch".to_string(), Arc::downgrade(&recorder))
            .unwrap();

        let message = Message::new("hello").int(1);
        a.send(Frame::Message(message.clone())).unwrap();

        let (frame, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame, Frame::Message(message));
        assert_eq!(thread.as_deref(), Some("jsbridge-test-dispatch"));
    }

    #[test]
    fn test_undecodable_frames_are_skipped() {
        let (a, b) = LocalChannel::pair();
        let (tx, rx) = std_mpsc::channel();
        let recorder: Arc<dyn FrameHandler> = Arc::new(Recorder { tx: Mutex::new(tx) });
        b.start("jsbridge-test-skip".to_string(), Arc::downgrade(&recorder))
            .unwrap();

        a.send_raw(b"garbage".to_vec()).unwrap();
        a.send(Frame::Message(Message::new("after"))).unwrap();

        let (frame, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame, Frame::Message(Message::new("after")));
    }

    #[test]
    fn test_start_twice_fails_and_close_stops_sending() {
        let (a, b) = LocalChannel::pair();
        let (tx, _rx) = std_mpsc::channel();
        let recorder: Arc<dyn FrameHandler> = Arc::new(Recorder { tx: Mutex::new(tx) });
        b.start("jsbridge-test-once".to_string(), Arc::downgrade(&recorder))
            .unwrap();
        assert!(b
            .start("jsbridge-test-twice".to_string(), Arc::downgrade(&recorder))
            .is_err());

        a.close();
        assert!(a.is_closed());
        assert!(matches!(
            a.send(Frame::Message(Message::new("x"))),
            Err(BridgeError::ChannelClosed)
        ));
    }
}
