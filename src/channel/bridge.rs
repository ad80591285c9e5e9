use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use channel_plugin::{AuthRequest, ChannelExtension, ChannelId, ChannelMessage, ChannelState, ConnectionEvent};
use crossbeam_utils::atomic::AtomicCell;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::channel::error::ChannelError;
use crate::channel::event::ChannelEvent;
use crate::channel::registration::error_message_for;
use crate::io::connection::LongPollConfig;
use crate::io::dispatch::IoMessageDispatcher;
use crate::io::error::IoError;
use crate::io::handle::{ConnectionHandle, ConnectionState};
use crate::io::manager::IoConnectionManager;
use crate::io::policy::{KeepAliveConfig, ReconnectPolicy};
use crate::io::PipePeer;

pub const EVENT_CAPACITY: usize = 256;
pub const UNKNOWN_OUTBOUND_FAILURE: &str = "Unknown outbound failure";
pub const CONNECTION_CLOSED_CODE: u16 = 1000;

/// Per-channel facade between the host and the extension that implements the channel.
///
/// Calls coming *from* the extension (`report_*`, `emit_inbound_message`,
/// `notify_outbound_result`) become [`ChannelEvent`]s; calls going *to* it
/// (`deliver_to_extension`, `notify_connection_event`, `send_message`) are
/// forwarded to the extension runtime.
#[async_trait]
pub trait ChannelBridge: Send + Sync + 'static {
    fn channel_id(&self) -> &ChannelId;

    async fn deliver_to_extension(&self, connection_id: &str, data: Vec<u8>);

    async fn notify_connection_event(&self, event: ConnectionEvent);

    async fn emit_inbound_message(&self, message: ChannelMessage) -> Result<(), ChannelError>;

    async fn report_state_change(
        &self,
        new_state: ChannelState,
        error_message: Option<String>,
    ) -> Result<(), ChannelError>;

    async fn report_auth_request(&self, request: AuthRequest) -> Result<(), ChannelError>;

    async fn notify_outbound_result(
        &self,
        message_id: &str,
        success: bool,
        reason: Option<String>,
    ) -> Result<(), ChannelError>;

    /// Hands a message to the extension. Only legal while the channel is CONNECTED.
    async fn send_message(&self, message: ChannelMessage) -> Result<(), ChannelError>;

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    async fn state(&self) -> ChannelState;

    /// Tears down everything the bridge owns and leaves it UNREGISTERED. Idempotent.
    async fn close(&self);
}

pub(crate) fn check_message_channel(channel_id: &ChannelId, message: &ChannelMessage) -> Result<(), ChannelError> {
    message.validate()?;
    if &message.channel_id != channel_id {
        return Err(ChannelError::InvalidInput(format!(
            "message {} belongs to {}, not {}",
            message.id, message.channel_id, channel_id
        )));
    }
    Ok(())
}

struct BridgeState {
    state: ChannelState,
    active: HashMap<String, ConnectionHandle>,
    frame_tasks: HashMap<String, JoinHandle<()>>,
    pending: HashMap<String, ChannelMessage>,
}

impl BridgeState {
    /// Drops a connection from the active set and stops its forwarder.
    fn forget(&mut self, connection_id: &str) -> Option<ConnectionHandle> {
        if let Some(task) = self.frame_tasks.remove(connection_id) {
            task.abort();
        }
        self.active.remove(connection_id)
    }
}

/// Bridge for extensions whose traffic runs over manager-owned connections.
///
/// Must be created inside a tokio runtime: it starts a task that turns the
/// manager's connection-state updates into extension connection events.
pub struct IoChannelBridge {
    channel_id: ChannelId,
    manager: Arc<IoConnectionManager>,
    extension: Arc<dyn ChannelExtension>,
    dispatcher: Option<Arc<IoMessageDispatcher>>,
    inner: Arc<Mutex<BridgeState>>,
    events: broadcast::Sender<ChannelEvent>,
    state_task: AtomicCell<Option<JoinHandle<()>>>,
}

impl fmt::Debug for IoChannelBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoChannelBridge")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl IoChannelBridge {
    pub fn new(
        channel_id: ChannelId,
        manager: Arc<IoConnectionManager>,
        extension: Arc<dyn ChannelExtension>,
        dispatcher: Option<Arc<IoMessageDispatcher>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Mutex::new(BridgeState {
            state: ChannelState::Registered,
            active: HashMap::new(),
            frame_tasks: HashMap::new(),
            pending: HashMap::new(),
        }));
        let state_task = tokio::spawn(relay_connection_states(
            channel_id.clone(),
            manager.connection_state_updates(),
            inner.clone(),
            extension.clone(),
        ));
        Self {
            channel_id,
            manager,
            extension,
            dispatcher,
            inner,
            events,
            state_task: AtomicCell::new(Some(state_task)),
        }
    }

    fn publish(&self, event: ChannelEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.inner.lock().await.state == ChannelState::Unregistered {
            return Err(ChannelError::InvalidInput(format!("bridge for {} is closed", self.channel_id)));
        }
        Ok(())
    }

    pub async fn open_websocket(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        policy: ReconnectPolicy,
        keep_alive: KeepAliveConfig,
    ) -> Result<ConnectionHandle, ChannelError> {
        self.ensure_open().await?;
        let handle = self
            .manager
            .open_websocket(&self.channel_id, url, headers, policy, keep_alive)
            .await?;
        self.track(&handle).await;
        Ok(handle)
    }

    pub async fn open_tcp(&self, address: &str, policy: ReconnectPolicy) -> Result<ConnectionHandle, ChannelError> {
        self.ensure_open().await?;
        let handle = self.manager.open_tcp(&self.channel_id, address, policy).await?;
        self.track(&handle).await;
        Ok(handle)
    }

    pub async fn start_long_poll(&self, config: LongPollConfig) -> Result<ConnectionHandle, ChannelError> {
        self.ensure_open().await?;
        let handle = self.manager.start_long_poll(&self.channel_id, config).await?;
        self.track(&handle).await;
        Ok(handle)
    }

    /// Opens an in-process pipe and returns its producer end alongside the handle.
    pub async fn open_pipe(&self) -> Result<(ConnectionHandle, PipePeer), ChannelError> {
        self.ensure_open().await?;
        let handle = self.manager.open_pipe(&self.channel_id).await?;
        let peer = self
            .manager
            .pipe_peer(&handle)
            .ok_or_else(|| IoError::NotFound(format!("pipe peer of {}", handle.id())))?;
        self.track(&handle).await;
        Ok((handle, peer))
    }

    /// Adds a freshly opened connection to the active set and starts forwarding its frames.
    async fn track(&self, handle: &ConnectionHandle) {
        let id = handle.id().to_string();
        let frames = self.manager.frames_of(handle);
        {
            let mut inner = self.inner.lock().await;
            inner.active.insert(id.clone(), handle.clone());
            if let Some(mut frames) = frames {
                let extension = self.extension.clone();
                let task = tokio::spawn(async move {
                    while let Some(frame) = frames.recv().await {
                        extension.deliver(&frame.connection_id, frame.payload).await;
                    }
                });
                inner.frame_tasks.insert(id.clone(), task);
            }
        }
        // the connection may already have ended before it was tracked
        if !matches!(self.manager.state_of(handle), Some(state) if !state.is_terminal()) {
            self.inner.lock().await.forget(&id);
        }
    }

    fn active_handle(inner: &BridgeState, connection_id: &str) -> Result<ConnectionHandle, ChannelError> {
        inner
            .active
            .get(connection_id)
            .cloned()
            .ok_or_else(|| IoError::NotFound(format!("connection {connection_id}")).into())
    }

    pub async fn send(&self, connection_id: &str, data: Vec<u8>) -> Result<(), ChannelError> {
        let handle = Self::active_handle(&*self.inner.lock().await, connection_id)?;
        Ok(self.manager.send(&handle, data).await?)
    }

    pub async fn send_text(&self, connection_id: &str, text: &str) -> Result<(), ChannelError> {
        let handle = Self::active_handle(&*self.inner.lock().await, connection_id)?;
        Ok(self.manager.send_text(&handle, text).await?)
    }

    pub async fn close_connection(&self, connection_id: &str) -> Result<(), ChannelError> {
        let handle = self
            .inner
            .lock()
            .await
            .forget(connection_id)
            .ok_or_else(|| IoError::NotFound(format!("connection {connection_id}")))?;
        match self.manager.close(&handle).await {
            Ok(()) | Err(IoError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close_all_connections(&self) -> usize {
        {
            let mut inner = self.inner.lock().await;
            let ids: Vec<String> = inner.active.keys().cloned().collect();
            for id in ids {
                inner.forget(&id);
            }
        }
        self.manager.close_all(&self.channel_id).await
    }

    /// Live handles of the connections this bridge tracks.
    pub async fn active_connections(&self) -> Vec<ConnectionHandle> {
        let inner = self.inner.lock().await;
        self.manager
            .connections_of(&self.channel_id)
            .into_iter()
            .filter(|handle| inner.active.contains_key(handle.id()))
            .collect()
    }
}

async fn relay_connection_states(
    channel_id: ChannelId,
    mut updates: broadcast::Receiver<ConnectionHandle>,
    inner: Arc<Mutex<BridgeState>>,
    extension: Arc<dyn ChannelExtension>,
) {
    loop {
        let handle = match updates.recv().await {
            Ok(handle) => handle,
            Err(RecvError::Lagged(skipped)) => {
                warn!(channel_id = %channel_id, skipped, "bridge fell behind connection updates");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if handle.channel_id() != &channel_id {
            continue;
        }
        let connection_id = handle.id().to_string();
        let event = match handle.state() {
            ConnectionState::Connected => ConnectionEvent::Opened { connection_id },
            ConnectionState::Closed => {
                inner.lock().await.forget(&connection_id);
                ConnectionEvent::Closed {
                    connection_id,
                    code: CONNECTION_CLOSED_CODE,
                    reason: "Closed".into(),
                }
            }
            ConnectionState::Failed => {
                inner.lock().await.forget(&connection_id);
                ConnectionEvent::Error {
                    connection_id,
                    message: "connection failed".into(),
                }
            }
            _ => continue,
        };
        debug!(channel_id = %channel_id, ?event, "connection event");
        extension.on_connection_event(event).await;
    }
}

#[async_trait]
impl ChannelBridge for IoChannelBridge {
    fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    async fn deliver_to_extension(&self, connection_id: &str, data: Vec<u8>) {
        self.extension.deliver(connection_id, data).await;
    }

    async fn notify_connection_event(&self, event: ConnectionEvent) {
        self.extension.on_connection_event(event).await;
    }

    #[instrument(skip(self, message), fields(channel_id = %self.channel_id, message_id = %message.id))]
    async fn emit_inbound_message(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        check_message_channel(&self.channel_id, &message)?;
        self.publish(ChannelEvent::MessageReceived {
            message: message.clone(),
        });
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(&self.channel_id, message).await;
        }
        Ok(())
    }

    async fn report_state_change(
        &self,
        new_state: ChannelState,
        error_message: Option<String>,
    ) -> Result<(), ChannelError> {
        let previous = {
            let mut inner = self.inner.lock().await;
            let previous = inner.state;
            if !previous.can_transition_to(new_state) {
                return Err(ChannelError::InvalidTransition {
                    channel_id: self.channel_id.clone(),
                    from: previous,
                    to: new_state,
                });
            }
            let error_message = error_message_for(new_state, error_message)?;
            inner.state = new_state;
            self.publish(ChannelEvent::StateChanged {
                channel_id: self.channel_id.clone(),
                previous,
                new: new_state,
                error_message,
            });
            previous
        };
        info!(channel_id = %self.channel_id, from = %previous, to = %new_state, "channel state changed");
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

    async fn notify_outbound_result(
        &self,
        message_id: &str,
        success: bool,
        reason: Option<String>,
    ) -> Result<(), ChannelError> {
        if message_id.trim().is_empty() {
            return Err(ChannelError::InvalidInput("message id must not be blank".into()));
        }
        let Some(message) = self.inner.lock().await.pending.remove(message_id) else {
            debug!(channel_id = %self.channel_id, message_id, "outbound result for unknown message");
            return Ok(());
        };
        if success {
            self.publish(ChannelEvent::MessageSent { message });
        } else {
            let reason = reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_OUTBOUND_FAILURE.to_string());
            warn!(channel_id = %self.channel_id, message_id, %reason, "outbound message failed");
            self.publish(ChannelEvent::MessageSendFailed {
                session_id: message.session_id,
                channel_id: self.channel_id.clone(),
                reason,
            });
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(channel_id = %self.channel_id, message_id = %message.id))]
    async fn send_message(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        check_message_channel(&self.channel_id, &message)?;
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ChannelState::Connected {
                return Err(ChannelError::NotConnected(self.channel_id.clone()));
            }
            inner.pending.insert(message.id.clone(), message.clone());
        }
        let message_id = message.id.clone();
        let session_id = message.session_id.clone();
        if let Err(e) = self.extension.send_outbound(message).await {
            self.inner.lock().await.pending.remove(&message_id);
            warn!(error = %e, "extension rejected outbound message");
            self.publish(ChannelEvent::MessageSendFailed {
                session_id,
                channel_id: self.channel_id.clone(),
                reason: e.to_string(),
            });
            return Err(e.into());
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    async fn close(&self) {
        if let Some(task) = self.state_task.take() {
            task.abort();
        }
        let previous = {
            let mut inner = self.inner.lock().await;
            for (_, task) in inner.frame_tasks.drain() {
                task.abort();
            }
            inner.active.clear();
            inner.pending.clear();
            std::mem::replace(&mut inner.state, ChannelState::Unregistered)
        };
        let closed = self.manager.close_all(&self.channel_id).await;
        if previous != ChannelState::Unregistered {
            info!(channel_id = %self.channel_id, connections = closed, "channel bridge closed");
            self.publish(ChannelEvent::StateChanged {
                channel_id: self.channel_id.clone(),
                previous,
                new: ChannelState::Unregistered,
                error_message: None,
            });
        }
    }
}

impl Drop for IoChannelBridge {
    fn drop(&mut self) {
        if let Some(task) = self.state_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigStore;
    use crate::io::frame::FrameType;
    use crate::io::http::ReqwestHttpClient;
    use crate::io::queue::InboundMessageQueue;
    use crate::io::dispatch::NotifyRuntimeWaker;
    use crate::session::InMemorySessionStore;
    use channel_plugin::plugin_helpers::build_text_message;
    use channel_plugin::plugin_test_util::MockExtension;
    use channel_plugin::{MessageDirection, SessionId};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn ch() -> ChannelId {
        ChannelId::new("acme.chat").unwrap()
    }

    fn manager() -> Arc<IoConnectionManager> {
        Arc::new(IoConnectionManager::new(
            Arc::new(ReqwestHttpClient::new()),
            Arc::new(MapConfigStore::new()),
        ))
    }

    fn outbound(body: &str) -> ChannelMessage {
        build_text_message(&ch(), &SessionId::from("s1"), MessageDirection::Outbound, body)
    }

    async fn connect(bridge: &IoChannelBridge) {
        for state in [ChannelState::Connecting, ChannelState::Authenticating, ChannelState::Connected] {
            bridge.report_state_change(state, None).await.unwrap();
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn send_requires_connected() {
        let ext = MockExtension::new();
        let bridge = IoChannelBridge::new(ch(), manager(), Arc::new(ext.clone()), None);
        let err = bridge.send_message(outbound("early")).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(_)));
        assert!(ext.outbound().await.is_empty());
        assert!(bridge.inner.lock().await.pending.is_empty());
    }

    #[tokio::test]
    async fn outbound_result_completes_pending() {
        let ext = MockExtension::new();
        let bridge = IoChannelBridge::new(ch(), manager(), Arc::new(ext.clone()), None);
        connect(&bridge).await;
        let mut events = bridge.subscribe();

        let ok = outbound("first");
        let bad = outbound("second");
        bridge.send_message(ok.clone()).await.unwrap();
        bridge.send_message(bad.clone()).await.unwrap();
        assert_eq!(ext.outbound().await.len(), 2);

        bridge.notify_outbound_result(&ok.id, true, None).await.unwrap();
        assert_eq!(next_event(&mut events).await, ChannelEvent::MessageSent { message: ok.clone() });

        bridge.notify_outbound_result(&bad.id, false, None).await.unwrap();
        match next_event(&mut events).await {
            ChannelEvent::MessageSendFailed { reason, session_id, .. } => {
                assert_eq!(reason, UNKNOWN_OUTBOUND_FAILURE);
                assert_eq!(session_id, bad.session_id);
            }
            other => panic!("unexpected {other:?}"),
        }

        // already completed: no event
        bridge.notify_outbound_result(&ok.id, true, None).await.unwrap();
        assert!(timeout(Duration::from_millis(50), events.recv()).await.is_err());
        assert!(matches!(
            bridge.notify_outbound_result(" ", true, None).await,
            Err(ChannelError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn extension_failure_clears_pending() {
        let ext = MockExtension::new();
        ext.fail_outbound_with("platform down").await;
        let bridge = IoChannelBridge::new(ch(), manager(), Arc::new(ext.clone()), None);
        connect(&bridge).await;
        let mut events = bridge.subscribe();

        let err = bridge.send_message(outbound("x")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Extension(_)));
        assert!(bridge.inner.lock().await.pending.is_empty());
        match next_event(&mut events).await {
            ChannelEvent::MessageSendFailed { reason, .. } => assert!(reason.contains("platform down")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn state_changes_follow_adjacency() {
        let bridge = IoChannelBridge::new(ch(), manager(), Arc::new(MockExtension::new()), None);
        let mut events = bridge.subscribe();

        let err = bridge.report_state_change(ChannelState::Connected, None).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidTransition { .. }));
        assert_eq!(bridge.state().await, ChannelState::Registered);

        bridge.report_state_change(ChannelState::Connecting, None).await.unwrap();
        bridge
            .report_state_change(ChannelState::Error, Some("bad token".into()))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::StateChanged {
                channel_id: ch(),
                previous: ChannelState::Registered,
                new: ChannelState::Connecting,
                error_message: None,
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::StateChanged {
                channel_id: ch(),
                previous: ChannelState::Connecting,
                new: ChannelState::Error,
                error_message: Some("bad token".into()),
            }
        );
    }

    #[tokio::test]
    async fn auth_request_is_published_without_state_change() {
        let bridge = IoChannelBridge::new(ch(), manager(), Arc::new(MockExtension::new()), None);
        let mut events = bridge.subscribe();
        bridge.report_auth_request(AuthRequest::token("Bot token")).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ChannelEvent::AuthRequired { .. }));
        assert_eq!(bridge.state().await, ChannelState::Registered);

        let blank = AuthRequest::QrCode {
            data_uri: "".into(),
            expires_at: None,
        };
        assert!(bridge.report_auth_request(blank).await.is_err());
    }

    #[tokio::test]
    async fn pipe_frames_reach_extension_and_close_is_reported() {
        let ext = MockExtension::new();
        let mgr = manager();
        let bridge = IoChannelBridge::new(ch(), mgr.clone(), Arc::new(ext.clone()), None);

        let (handle, mut peer) = bridge.open_pipe().await.unwrap();
        assert_eq!(bridge.active_connections().await.len(), 1);
        ext.wait_for_event(|e| matches!(e, ConnectionEvent::Opened { .. }), WAIT)
            .await
            .unwrap();

        peer.push(b"hello".to_vec(), FrameType::Binary).await.unwrap();
        let delivered = ext.wait_for_deliveries(1, WAIT).await;
        assert_eq!(delivered, vec![(handle.id().to_string(), b"hello".to_vec())]);

        bridge.send(handle.id(), b"reply".to_vec()).await.unwrap();
        assert_eq!(timeout(WAIT, peer.recv()).await.unwrap().unwrap().payload, b"reply");

        bridge.close_connection(handle.id()).await.unwrap();
        let closed = ext
            .wait_for_event(|e| matches!(e, ConnectionEvent::Closed { .. }), WAIT)
            .await
            .unwrap();
        assert_eq!(
            closed,
            ConnectionEvent::Closed {
                connection_id: handle.id().to_string(),
                code: 1000,
                reason: "Closed".into(),
            }
        );
        assert!(bridge.active_connections().await.is_empty());
        assert!(matches!(
            bridge.send(handle.id(), vec![1]).await,
            Err(ChannelError::Io(IoError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn inbound_messages_are_dispatched() {
        let waker = Arc::new(NotifyRuntimeWaker::new());
        let queue = Arc::new(InboundMessageQueue::default());
        let dispatcher = Arc::new(IoMessageDispatcher::new(
            queue.clone(),
            waker.clone(),
            InMemorySessionStore::new(Duration::from_secs(60)),
        ));
        let bridge = IoChannelBridge::new(ch(), manager(), Arc::new(MockExtension::new()), Some(dispatcher));
        let mut events = bridge.subscribe();

        let msg = build_text_message(&ch(), &SessionId::from("chat-9"), MessageDirection::Inbound, "hi");
        bridge.emit_inbound_message(msg.clone()).await.unwrap();
        assert_eq!(next_event(&mut events).await, ChannelEvent::MessageReceived { message: msg.clone() });
        assert_eq!(queue.drain(&SessionId::from("chat-9")), vec![msg]);
        assert_eq!(waker.next_wakes().await.len(), 1);

        let foreign = build_text_message(
            &ChannelId::new("acme.other").unwrap(),
            &SessionId::from("chat-9"),
            MessageDirection::Inbound,
            "hi",
        );
        assert!(matches!(
            bridge.emit_inbound_message(foreign).await,
            Err(ChannelError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let ext = MockExtension::new();
        let mgr = manager();
        let bridge = IoChannelBridge::new(ch(), mgr.clone(), Arc::new(ext.clone()), None);
        bridge.open_pipe().await.unwrap();
        bridge.open_pipe().await.unwrap();
        connect(&bridge).await;

        bridge.close().await;
        assert_eq!(bridge.state().await, ChannelState::Unregistered);
        assert!(mgr.connections_of(&ch()).is_empty());
        bridge.close().await;
        assert_eq!(bridge.state().await, ChannelState::Unregistered);

        assert!(bridge.open_pipe().await.is_err());
        assert!(matches!(
            bridge.send_message(outbound("late")).await,
            Err(ChannelError::NotConnected(_))
        ));
    }
}
