use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::io::connection::{ConnectionCore, FrameReceiver, IoConnection};
use crate::io::error::IoError;
use crate::io::frame::{FrameType, IoFrame};
use crate::io::handle::{ConnectionHandle, ConnectionState};

pub const PIPE_CAPACITY: usize = 64;

/// In-process connection backed by two bounded queues. No network involved.
pub struct PipeConnection {
    core: Arc<ConnectionCore>,
    outbound_tx: std::sync::Mutex<Option<mpsc::Sender<IoFrame>>>,
    closed: CancellationToken,
    peer: std::sync::Mutex<Option<PipePeer>>,
}

/// The producer end of a pipe: feeds inbound frames and reads what the host sent.
pub struct PipePeer {
    connection_id: String,
    inbound: mpsc::Sender<IoFrame>,
    outbound: mpsc::Receiver<IoFrame>,
    state: watch::Receiver<ConnectionHandle>,
}

impl PipeConnection {
    pub fn new(handle: ConnectionHandle) -> Self {
        let core = Arc::new(ConnectionCore::with_capacity(handle, PIPE_CAPACITY));
        let (outbound_tx, outbound_rx) = mpsc::channel(PIPE_CAPACITY);
        let peer = PipePeer {
            connection_id: core.id(),
            inbound: core.frame_sender(),
            outbound: outbound_rx,
            state: core.subscribe(),
        };
        Self {
            core,
            outbound_tx: std::sync::Mutex::new(Some(outbound_tx)),
            closed: CancellationToken::new(),
            peer: std::sync::Mutex::new(Some(peer)),
        }
    }

    /// Hands out the producer end; only the first call gets it.
    pub fn take_peer(&self) -> Option<PipePeer> {
        self.peer.lock().ok().and_then(|mut p| p.take())
    }

    /// Queues a frame for the peer. A send parked on a full queue gives up once the pipe closes.
    async fn push_outbound(&self, data: Vec<u8>, frame_type: FrameType) -> Result<(), IoError> {
        self.core.ensure_connected()?;
        let id = self.core.id();
        let frame = IoFrame::now(&id, data, frame_type)?;
        let tx = self
            .outbound_tx
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| IoError::send(&id, "pipe closed"))?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(IoError::send(&id, "pipe closed")),
            sent = tx.send(frame) => sent.map_err(|_| IoError::send(&id, "pipe peer dropped")),
        }
    }
}

#[async_trait]
impl IoConnection for PipeConnection {
    fn handle(&self) -> ConnectionHandle {
        self.core.handle()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionHandle> {
        self.core.subscribe()
    }

    fn take_frames(&self) -> Option<FrameReceiver> {
        self.core.take_frames()
    }

    async fn open(&self) -> Result<(), IoError> {
        self.core.try_transition(ConnectionState::Connecting)?;
        self.core.try_transition(ConnectionState::Connected)?;
        debug!(connection_id = %self.core.id(), "pipe open");
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), IoError> {
        self.push_outbound(data, FrameType::Binary).await
    }

    async fn send_text(&self, text: &str) -> Result<(), IoError> {
        self.push_outbound(text.as_bytes().to_vec(), FrameType::Text).await
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Ok(mut tx) = self.outbound_tx.lock() {
            tx.take();
        }
        if self.core.transition(ConnectionState::Closed) {
            debug!(connection_id = %self.core.id(), "pipe closed");
        }
    }
}

impl PipePeer {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Pushes a payload to the host side of the pipe.
    pub async fn push(&self, payload: Vec<u8>, frame_type: FrameType) -> Result<(), IoError> {
        let state = self.state.borrow().state();
        if state != ConnectionState::Connected {
            return Err(IoError::send(&self.connection_id, format!("pipe is {state}")));
        }
        let frame = IoFrame::now(&self.connection_id, payload, frame_type)?;
        self.inbound
            .send(frame)
            .await
            .map_err(|_| IoError::send(&self.connection_id, "host side dropped"))
    }

    pub async fn push_text(&self, text: &str) -> Result<(), IoError> {
        self.push(text.as_bytes().to_vec(), FrameType::Text).await
    }

    /// Next frame the host sent; `None` once the pipe is closed and drained.
    pub async fn recv(&mut self) -> Option<IoFrame> {
        self.outbound.recv().await
    }
}
