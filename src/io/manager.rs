use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use channel_plugin::ChannelId;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::io::connection::{
    FrameReceiver, IoConnection, LongPollConfig, LongPollConnection, PipeConnection, PipePeer, TcpConnection,
    WebSocketConnection,
};
use crate::io::error::IoError;
use crate::io::handle::{ConnectionHandle, ConnectionState, ConnectionType};
use crate::io::http::{HttpClient, HttpRequest, HttpResponse};
use crate::io::policy::{KeepAliveConfig, ReconnectPolicy};

pub const STATE_UPDATE_CAPACITY: usize = 256;
const STATE_DRAIN: Duration = Duration::from_secs(1);

struct ManagedConnection {
    channel_id: ChannelId,
    connection: Arc<dyn IoConnection>,
    state_task: JoinHandle<()>,
}

/// Owns every open connection of every channel.
///
/// Callers only ever get handles back; the transports stay inside the table
/// and are reachable solely through the manager's methods.
pub struct IoConnectionManager {
    connections: DashMap<String, ManagedConnection>,
    pipe_peers: DashMap<String, PipePeer>,
    updates: broadcast::Sender<ConnectionHandle>,
    http: Arc<dyn HttpClient>,
    config_store: Arc<dyn ConfigStore>,
}

impl fmt::Debug for IoConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("IoConnectionManager").field("connections", &ids).finish()
    }
}

impl IoConnectionManager {
    pub fn new(http: Arc<dyn HttpClient>, config_store: Arc<dyn ConfigStore>) -> Self {
        let (updates, _) = broadcast::channel(STATE_UPDATE_CAPACITY);
        Self {
            connections: DashMap::new(),
            pipe_peers: DashMap::new(),
            updates,
            http,
            config_store,
        }
    }

    pub async fn open_websocket(
        &self,
        channel_id: &ChannelId,
        url: &str,
        headers: Vec<(String, String)>,
        policy: ReconnectPolicy,
        keep_alive: KeepAliveConfig,
    ) -> Result<ConnectionHandle, IoError> {
        let handle = ConnectionHandle::new(ConnectionType::WebSocket, channel_id.clone(), Some(url.to_string()))?;
        let connection = WebSocketConnection::new(handle, headers, policy, keep_alive)?;
        self.register_and_open(Arc::new(connection)).await
    }

    pub async fn open_tcp(
        &self,
        channel_id: &ChannelId,
        address: &str,
        policy: ReconnectPolicy,
    ) -> Result<ConnectionHandle, IoError> {
        let handle = ConnectionHandle::new(ConnectionType::Tcp, channel_id.clone(), Some(address.to_string()))?;
        let connection = TcpConnection::new(handle, policy)?;
        self.register_and_open(Arc::new(connection)).await
    }

    pub async fn start_long_poll(
        &self,
        channel_id: &ChannelId,
        config: LongPollConfig,
    ) -> Result<ConnectionHandle, IoError> {
        let handle = ConnectionHandle::new(ConnectionType::LongPoll, channel_id.clone(), Some(config.url.clone()))?;
        let connection = LongPollConnection::new(handle, config, self.http.clone(), self.config_store.clone())?;
        self.register_and_open(Arc::new(connection)).await
    }

    /// Opens an in-process pipe; claim its producer end with [`Self::pipe_peer`].
    pub async fn open_pipe(&self, channel_id: &ChannelId) -> Result<ConnectionHandle, IoError> {
        let handle = ConnectionHandle::new(ConnectionType::Pipe, channel_id.clone(), None)?;
        let connection = PipeConnection::new(handle);
        if let Some(peer) = connection.take_peer() {
            self.pipe_peers.insert(peer.connection_id().to_string(), peer);
        }
        self.register_and_open(Arc::new(connection)).await
    }

    async fn register_and_open(&self, connection: Arc<dyn IoConnection>) -> Result<ConnectionHandle, IoError> {
        let handle = connection.handle();
        let id = handle.id().to_string();
        let mut state_rx = connection.subscribe_state();
        let updates = self.updates.clone();
        let state_task = tokio::spawn(async move {
            loop {
                let snapshot = state_rx.borrow_and_update().clone();
                let _ = updates.send(snapshot);
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        self.connections.insert(
            id.clone(),
            ManagedConnection {
                channel_id: handle.channel_id().clone(),
                connection: connection.clone(),
                state_task,
            },
        );

        if let Err(e) = connection.open().await {
            warn!(connection_id = %id, channel_id = %handle.channel_id(), error = %e, "open failed");
            // the state task ends on its own once the connection is dropped
            self.connections.remove(&id);
            self.pipe_peers.remove(&id);
            return Err(e);
        }
        info!(
            connection_id = %id,
            channel_id = %handle.channel_id(),
            transport = %handle.connection_type(),
            "connection opened"
        );
        Ok(connection.handle())
    }

    fn connection(&self, handle: &ConnectionHandle) -> Result<Arc<dyn IoConnection>, IoError> {
        self.connections
            .get(handle.id())
            .map(|m| m.connection.clone())
            .ok_or_else(|| IoError::NotFound(format!("connection {}", handle.id())))
    }

    pub async fn send(&self, handle: &ConnectionHandle, data: Vec<u8>) -> Result<(), IoError> {
        self.connection(handle)?.send(data).await
    }

    pub async fn send_text(&self, handle: &ConnectionHandle, text: &str) -> Result<(), IoError> {
        self.connection(handle)?.send_text(text).await
    }

    pub async fn close(&self, handle: &ConnectionHandle) -> Result<(), IoError> {
        let (id, managed) = self
            .connections
            .remove(handle.id())
            .ok_or_else(|| IoError::NotFound(format!("connection {}", handle.id())))?;
        self.retire(&id, managed).await;
        Ok(())
    }

    /// Removes and closes every connection owned by `channel_id`; returns how many.
    pub async fn close_all(&self, channel_id: &ChannelId) -> usize {
        let ids: Vec<String> = self
            .connections
            .iter()
            .filter(|e| &e.value().channel_id == channel_id)
            .map(|e| e.key().clone())
            .collect();
        let removed: Vec<(String, ManagedConnection)> =
            ids.iter().filter_map(|id| self.connections.remove(id)).collect();
        let count = removed.len();
        join_all(removed.into_iter().map(|(id, managed)| async move {
            self.retire(&id, managed).await;
        }))
        .await;
        if count > 0 {
            info!(channel_id = %channel_id, count, "closed all channel connections");
        }
        count
    }

    /// Closes every connection of every channel.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((id, managed)) = self.connections.remove(&id) {
                self.retire(&id, managed).await;
            }
        }
    }

    async fn retire(&self, id: &str, managed: ManagedConnection) {
        let ManagedConnection {
            connection,
            mut state_task,
            ..
        } = managed;
        connection.close().await;
        drop(connection);
        self.pipe_peers.remove(id);
        // let the final CLOSED snapshot through, then make sure the task is gone
        if tokio::time::timeout(STATE_DRAIN, &mut state_task).await.is_err() {
            state_task.abort();
        }
    }

    pub fn state_of(&self, handle: &ConnectionHandle) -> Option<ConnectionState> {
        self.connections.get(handle.id()).map(|m| m.connection.handle().state())
    }

    /// Claims the inbound frames of a live connection (once).
    pub fn frames_of(&self, handle: &ConnectionHandle) -> Option<FrameReceiver> {
        self.connections.get(handle.id()).and_then(|m| m.connection.take_frames())
    }

    /// Producer end of a pipe opened through [`Self::open_pipe`] (once).
    pub fn pipe_peer(&self, handle: &ConnectionHandle) -> Option<PipePeer> {
        self.pipe_peers.remove(handle.id()).map(|(_, peer)| peer)
    }

    /// Every state change of every connection, as handle snapshots.
    pub fn connection_state_updates(&self) -> broadcast::Receiver<ConnectionHandle> {
        self.updates.subscribe()
    }

    pub fn connections_of(&self, channel_id: &ChannelId) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .filter(|e| &e.value().channel_id == channel_id)
            .map(|e| e.value().connection.handle())
            .collect()
    }

    pub async fn http(&self, request: HttpRequest) -> Result<HttpResponse, IoError> {
        self.http.execute(request).await
    }

    pub fn cancel_http(&self, key: &str) {
        self.http.cancel(key);
    }
}
