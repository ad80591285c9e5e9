use std::fmt;

use async_trait::async_trait;
use channel_plugin::{AuthRequest, ChannelId, ChannelMessage, ChannelState, ConnectionEvent};
use crossbeam_utils::atomic::AtomicCell;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, trace};

use crate::channel::bridge::{ChannelBridge, EVENT_CAPACITY, check_message_channel};
use crate::channel::error::ChannelError;
use crate::channel::event::ChannelEvent;
use crate::channel::registration::error_message_for;
use crate::io::connection::pipe::PIPE_CAPACITY;

/// Bridge for extensions living in the same process: messages move over two
/// in-memory queues instead of sockets.
pub struct PipeChannelBridge {
    channel_id: ChannelId,
    state: Mutex<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    to_extension: mpsc::Sender<ChannelMessage>,
    to_host: mpsc::Sender<ChannelMessage>,
    extension_rx: AtomicCell<Option<mpsc::Receiver<ChannelMessage>>>,
    host_rx: AtomicCell<Option<mpsc::Receiver<ChannelMessage>>>,
}

impl fmt::Debug for PipeChannelBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeChannelBridge")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl PipeChannelBridge {
    pub fn new(channel_id: ChannelId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (to_extension, extension_rx) = mpsc::channel(PIPE_CAPACITY);
        let (to_host, host_rx) = mpsc::channel(PIPE_CAPACITY);
        Self {
            channel_id,
            state: Mutex::new(ChannelState::Registered),
            events,
            to_extension,
            to_host,
            extension_rx: AtomicCell::new(Some(extension_rx)),
            host_rx: AtomicCell::new(Some(host_rx)),
        }
    }

    /// Messages the host sent; read by the in-process extension. Claimable once.
    pub fn take_extension_queue(&self) -> Option<mpsc::Receiver<ChannelMessage>> {
        self.extension_rx.take()
    }

    /// Messages the extension emitted; read by the host. Claimable once.
    pub fn take_host_queue(&self) -> Option<mpsc::Receiver<ChannelMessage>> {
        self.host_rx.take()
    }

    fn publish(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ChannelBridge for PipeChannelBridge {
    fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    async fn deliver_to_extension(&self, connection_id: &str, data: Vec<u8>) {
        trace!(channel_id = %self.channel_id, connection_id, len = data.len(), "pipe bridge has no connections, dropping bytes");
    }

    async fn notify_connection_event(&self, event: ConnectionEvent) {
        trace!(channel_id = %self.channel_id, ?event, "pipe bridge ignores connection events");
    }

    async fn emit_inbound_message(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        check_message_channel(&self.channel_id, &message)?;
        self.to_host
            .send(message.clone())
            .await
            .map_err(|_| ChannelError::InvalidInput(format!("host queue of {} is closed", self.channel_id)))?;
        self.publish(ChannelEvent::MessageReceived { message });
        Ok(())
    }

    async fn report_state_change(
        &self,
        new_state: ChannelState,
        error_message: Option<String>,
    ) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if !state.can_transition_to(new_state) {
            return Err(ChannelError::InvalidTransition {
                channel_id: self.channel_id.clone(),
                from: *state,
                to: new_state,
            });
        }
        let error_message = error_message_for(new_state, error_message)?;
        let previous = std::mem::replace(&mut *state, new_state);
        self.publish(ChannelEvent::StateChanged {
            channel_id: self.channel_id.clone(),
            previous,
            new: new_state,
            error_message,
        });
        Ok(())
    }

    async fn report_auth_request(&self, request: AuthRequest) -> Result<(), ChannelError> {
        request.validate()?;
        self.publish(ChannelEvent::AuthRequired {
            channel_id: self.channel_id.clone(),
            request,
        });
        Ok(())
    }

    /// Pipe sends complete on hand-off, so there is never anything pending.
    async fn notify_outbound_result(
        &self,
        message_id: &str,
        _success: bool,
        _reason: Option<String>,
    ) -> Result<(), ChannelError> {
        if message_id.trim().is_empty() {
            return Err(ChannelError::InvalidInput("message id must not be blank".into()));
        }
        debug!(channel_id = %self.channel_id, message_id, "outbound result on pipe bridge ignored");
        Ok(())
    }

    async fn send_message(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        check_message_channel(&self.channel_id, &message)?;
        if *self.state.lock().await != ChannelState::Connected {
            return Err(ChannelError::NotConnected(self.channel_id.clone()));
        }
        self.to_extension
            .send(message.clone())
            .await
            .map_err(|_| ChannelError::NotConnected(self.channel_id.clone()))?;
        self.publish(ChannelEvent::MessageSent { message });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn state(&self) -> ChannelState {
        *self.state.lock().await
    }

    async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, ChannelState::Unregistered);
        if previous != ChannelState::Unregistered {
            self.publish(ChannelEvent::StateChanged {
                channel_id: self.channel_id.clone(),
                previous,
                new: ChannelState::Unregistered,
                error_message: None,
            });
        }
    }
}
