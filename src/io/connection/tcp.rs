use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::io::connection::{ConnectionCore, FrameReceiver, IoConnection};
use crate::io::error::IoError;
use crate::io::frame::FrameType;
use crate::io::handle::{ConnectionHandle, ConnectionState};
use crate::io::policy::ReconnectPolicy;
use crate::logger::metrics;

pub const READ_BUFFER_SIZE: usize = 8192;

/// Splits `tcp://host:port` into its parts.
pub fn parse_tcp_address(address: &str) -> Result<(String, u16), IoError> {
    let url = Url::parse(address).map_err(|e| IoError::InvalidInput(format!("bad TCP address '{address}': {e}")))?;
    if url.scheme() != "tcp" {
        return Err(IoError::InvalidInput(format!("TCP address must use tcp://, got '{address}'")));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| IoError::InvalidInput(format!("TCP address '{address}' has no host")))?;
    let port = url
        .port()
        .ok_or_else(|| IoError::InvalidInput(format!("TCP address '{address}' has no port")))?;
    // IPv6 literals come back bracketed
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((host, port))
}

struct TcpShared {
    core: Arc<ConnectionCore>,
    host: String,
    port: u16,
    policy: ReconnectPolicy,
    writer: Mutex<Option<OwnedWriteHalf>>,
    shutdown: CancellationToken,
    closed_gracefully: AtomicBool,
}

/// Raw TCP client with a dedicated read loop and policy-driven reconnects.
pub struct TcpConnection {
    inner: Arc<TcpShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnection {
    pub fn new(handle: ConnectionHandle, policy: ReconnectPolicy) -> Result<Self, IoError> {
        let address = handle
            .remote_address()
            .ok_or_else(|| IoError::InvalidInput("TCP connection requires an address".into()))?;
        let (host, port) = parse_tcp_address(address)?;
        Ok(Self {
            inner: Arc::new(TcpShared {
                core: Arc::new(ConnectionCore::new(handle)),
                host,
                port,
                policy,
                writer: Mutex::new(None),
                shutdown: CancellationToken::new(),
                closed_gracefully: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl IoConnection for TcpConnection {
    fn handle(&self) -> ConnectionHandle {
        self.inner.core.handle()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionHandle> {
        self.inner.core.subscribe()
    }

    fn take_frames(&self) -> Option<FrameReceiver> {
        self.inner.core.take_frames()
    }

    async fn open(&self) -> Result<(), IoError> {
        self.inner.core.try_transition(ConnectionState::Connecting)?;
        let (first_tx, first_rx) = oneshot::channel();
        let inner = self.inner.clone();
        *self.task.lock().await = Some(tokio::spawn(async move { inner.supervise(first_tx).await }));
        match first_rx.await {
            Ok(result) => result,
            Err(_) => Err(IoError::connect(self.inner.target(), "connect task ended")),
        }
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), IoError> {
        let core = &self.inner.core;
        core.ensure_connected()?;
        let mut guard = self.inner.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| IoError::send(core.id(), "socket not writable"))?;
        writer.write_all(&data).await.map_err(|e| IoError::send(core.id(), e))?;
        writer.flush().await.map_err(|e| IoError::send(core.id(), e))
    }

    async fn close(&self) {
        self.inner.closed_gracefully.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.inner.core.transition(ConnectionState::Closed);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

enum ReadEnd {
    Shutdown,
    Dropped(String),
}

impl TcpShared {
    fn target(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<OwnedReadHalf, IoError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| IoError::connect(self.target(), e))?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        *self.writer.lock().await = Some(write);
        Ok(read)
    }

    async fn supervise(self: Arc<Self>, first: oneshot::Sender<Result<(), IoError>>) {
        let id = self.core.id();
        let mut first = Some(first);
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.core.transition(ConnectionState::Closed);
                    return;
                }
                r = self.connect() => r,
            };

            match connected {
                Ok(reader) => {
                    attempt = 0;
                    if !self.core.transition(ConnectionState::Connected) {
                        return;
                    }
                    metrics().connections_opened.add(1, &[KeyValue::new("transport", "TCP")]);
                    info!(target: "io_event", connection_id = %id, target_addr = %self.target(), "tcp connected");
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }

                    match self.read_loop(reader).await {
                        ReadEnd::Shutdown => {
                            self.core.transition(ConnectionState::Closed);
                            return;
                        }
                        ReadEnd::Dropped(reason) => {
                            self.writer.lock().await.take();
                            if self.closed_gracefully.load(Ordering::SeqCst) {
                                self.core.transition(ConnectionState::Closed);
                                return;
                            }
                            warn!(connection_id = %id, %reason, "tcp connection lost");
                        }
                    }
                }
                Err(e) => {
                    if let Some(tx) = first.take() {
                        self.core.transition(ConnectionState::Failed);
                        let _ = tx.send(Err(e));
                        return;
                    }
                    warn!(connection_id = %id, error = %e, attempt, "tcp reconnect attempt failed");
                }
            }

            attempt += 1;
            if !self.core.transition(ConnectionState::Reconnecting) {
                return;
            }
            metrics().reconnect_attempts.add(1, &[KeyValue::new("transport", "TCP")]);
            if !self.policy.should_retry(attempt) {
                error!(target: "io_event", connection_id = %id, attempt, "tcp reconnect attempts exhausted");
                self.core.transition(ConnectionState::Failed);
                return;
            }
            let delay = self
                .policy
                .delay_for(attempt)
                .unwrap_or_else(|_| std::time::Duration::from_millis(self.policy.initial_delay_ms));
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.core.transition(ConnectionState::Closed);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.core.transition(ConnectionState::Connecting) {
                return;
            }
        }
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf) -> ReadEnd {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return ReadEnd::Shutdown,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return ReadEnd::Dropped("EOF".into()),
                    Ok(n) => {
                        if !self.core.emit(buf[..n].to_vec(), FrameType::Binary).await {
                            return ReadEnd::Shutdown;
                        }
                    }
                    Err(e) => return ReadEnd::Dropped(e.to_string()),
                }
            }
        }
    }
}
