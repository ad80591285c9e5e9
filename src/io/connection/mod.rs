pub mod long_poll;
pub mod pipe;
pub mod tcp;
pub mod websocket;

use std::future::pending;

use async_trait::async_trait;
use crossbeam_utils::atomic::AtomicCell;
use opentelemetry::KeyValue;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tracing::debug;

use crate::io::error::IoError;
use crate::io::frame::{FrameType, IoFrame};
use crate::io::handle::{ConnectionHandle, ConnectionState};
use crate::logger::metrics;

pub use long_poll::{LongPollConfig, LongPollConnection};
pub use pipe::{PipeConnection, PipePeer};
pub use tcp::TcpConnection;
pub use websocket::WebSocketConnection;

pub type FrameReceiver = mpsc::Receiver<IoFrame>;

/// Inbound frames buffered per connection before a consumer claims them.
pub const FRAME_BUFFER: usize = 256;

/// Common contract of every transport.
///
/// A connection owns its socket exclusively. Everything outside it sees only
/// handle snapshots (through [`IoConnection::subscribe_state`]) and frames.
#[async_trait]
pub trait IoConnection: Send + Sync + 'static {
    fn handle(&self) -> ConnectionHandle;

    /// Latest-value stream of handle snapshots; replays the current one.
    fn subscribe_state(&self) -> watch::Receiver<ConnectionHandle>;

    /// Claims the inbound frame stream. Frames are buffered from the moment the
    /// connection opens, so the first claimant sees all of them; later calls get `None`.
    fn take_frames(&self) -> Option<FrameReceiver>;

    async fn open(&self) -> Result<(), IoError>;

    async fn send(&self, data: Vec<u8>) -> Result<(), IoError>;

    async fn send_text(&self, _text: &str) -> Result<(), IoError> {
        Err(IoError::Unsupported(format!(
            "text frames on a {} connection",
            self.handle().connection_type()
        )))
    }

    /// Closes the connection and disables reconnection. Safe to call repeatedly.
    async fn close(&self);
}

/// State and frame plumbing shared by all transports.
pub(crate) struct ConnectionCore {
    handle: watch::Sender<ConnectionHandle>,
    frames_tx: mpsc::Sender<IoFrame>,
    frames_rx: AtomicCell<Option<FrameReceiver>>,
}

impl ConnectionCore {
    pub(crate) fn new(handle: ConnectionHandle) -> Self {
        Self::with_capacity(handle, FRAME_BUFFER)
    }

    pub(crate) fn with_capacity(handle: ConnectionHandle, capacity: usize) -> Self {
        let (handle, _) = watch::channel(handle);
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        Self {
            handle,
            frames_tx,
            frames_rx: AtomicCell::new(Some(frames_rx)),
        }
    }

    pub(crate) fn handle(&self) -> ConnectionHandle {
        self.handle.borrow().clone()
    }

    pub(crate) fn id(&self) -> String {
        self.handle.borrow().id().to_string()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.handle.borrow().state()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionHandle> {
        self.handle.subscribe()
    }

    pub(crate) fn take_frames(&self) -> Option<FrameReceiver> {
        self.frames_rx.take()
    }

    pub(crate) fn frame_sender(&self) -> mpsc::Sender<IoFrame> {
        self.frames_tx.clone()
    }

    /// Applies a validated transition; illegal ones are rejected and logged.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut rejected = None;
        let changed = self.handle.send_if_modified(|h| match h.with_state(next) {
            Ok(updated) => {
                *h = updated;
                true
            }
            Err(e) => {
                rejected = Some(e);
                false
            }
        });
        if let Some(e) = rejected {
            debug!(connection_id = %self.id(), error = %e, "state transition rejected");
        }
        changed
    }

    /// Like `transition`, but surfaces the rejection to the caller.
    pub(crate) fn try_transition(&self, next: ConnectionState) -> Result<(), IoError> {
        let from = self.state();
        if self.transition(next) {
            Ok(())
        } else {
            Err(IoError::InvalidTransition { from, to: next })
        }
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), IoError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            other => Err(IoError::send(self.id(), format!("connection is {other}"))),
        }
    }

    /// Pushes one inbound frame; waits while the buffer is full.
    /// Returns false once nobody can ever read the frames again.
    pub(crate) async fn emit(&self, payload: Vec<u8>, frame_type: FrameType) -> bool {
        let frame = match IoFrame::now(self.id(), payload, frame_type) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                return true;
            }
        };
        let transport = self.handle.borrow().connection_type().to_string();
        metrics().frames_received.add(1, &[KeyValue::new("transport", transport)]);
        self.frames_tx.send(frame).await.is_ok()
    }
}

pub(crate) async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => pending().await,
    }
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => pending().await,
    }
}
