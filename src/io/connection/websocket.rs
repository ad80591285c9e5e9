use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use opentelemetry::KeyValue;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::io::connection::{ConnectionCore, FrameReceiver, IoConnection, sleep_until_opt, tick_opt};
use crate::io::error::IoError;
use crate::io::frame::FrameType;
use crate::io::handle::{ConnectionHandle, ConnectionState};
use crate::io::policy::{KeepAliveConfig, ReconnectPolicy};
use crate::logger::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

fn normal_closure() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: String::from("Normal closure").into(),
    }))
}

struct WsShared {
    core: Arc<ConnectionCore>,
    url: String,
    headers: Vec<(String, String)>,
    policy: ReconnectPolicy,
    keep_alive: KeepAliveConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    shutdown: CancellationToken,
    closed_gracefully: AtomicBool,
}

/// WebSocket client with keep-alive pings and policy-driven reconnects.
///
/// Only the first connect attempt is reported back to `open()`; later
/// reconnects show up solely as state transitions.
pub struct WebSocketConnection {
    inner: Arc<WsShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketConnection {
    pub fn new(
        handle: ConnectionHandle,
        headers: Vec<(String, String)>,
        policy: ReconnectPolicy,
        keep_alive: KeepAliveConfig,
    ) -> Result<Self, IoError> {
        let url = handle
            .remote_address()
            .ok_or_else(|| IoError::InvalidInput("WebSocket connection requires a URL".into()))?
            .to_string();
        let parsed = url::Url::parse(&url).map_err(|e| IoError::InvalidInput(format!("bad WebSocket URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(IoError::InvalidInput(format!("WebSocket URL must use ws:// or wss://, got '{url}'")));
        }
        for (name, value) in &headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| IoError::InvalidInput(format!("bad header name '{name}': {e}")))?;
            HeaderValue::from_str(value).map_err(|e| IoError::InvalidInput(format!("bad header value for '{name}': {e}")))?;
        }
        Ok(Self {
            inner: Arc::new(WsShared {
                core: Arc::new(ConnectionCore::new(handle)),
                url,
                headers,
                policy,
                keep_alive,
                outbound: Mutex::new(None),
                shutdown: CancellationToken::new(),
                closed_gracefully: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl IoConnection for WebSocketConnection {
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
            Err(_) => Err(IoError::connect(&self.inner.url, "connect task ended")),
        }
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), IoError> {
        self.inner.enqueue(Message::binary(data)).await
    }

    async fn send_text(&self, text: &str) -> Result<(), IoError> {
        self.inner.enqueue(Message::text(text.to_string())).await
    }

    async fn close(&self) {
        self.inner.closed_gracefully.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        if let Some(mut task) = self.task.lock().await.take() {
            // give the session a moment to send the close frame
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.inner.core.transition(ConnectionState::Closed);
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

impl WsShared {
    async fn enqueue(&self, message: Message) -> Result<(), IoError> {
        self.core.ensure_connected()?;
        let guard = self.outbound.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| IoError::send(self.core.id(), "no live WebSocket session"))?;
        tx.send(message)
            .map_err(|_| IoError::send(self.core.id(), "WebSocket session ended"))
    }

    async fn connect(&self) -> Result<WsStream, IoError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| IoError::connect(&self.url, e))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| IoError::connect(&self.url, e))?;
            let value = HeaderValue::from_str(value).map_err(|e| IoError::connect(&self.url, e))?;
            request.headers_mut().insert(name, value);
        }
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| IoError::connect(&self.url, e))?;
        Ok(stream)
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
                Ok(stream) => {
                    attempt = 0;
                    if !self.core.transition(ConnectionState::Connected) {
                        return;
                    }
                    metrics().connections_opened.add(1, &[KeyValue::new("transport", "WEBSOCKET")]);
                    info!(target: "io_event", connection_id = %id, url = %self.url, "websocket connected");
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }

                    match self.run_session(stream).await {
                        SessionEnd::Shutdown => {
                            self.core.transition(ConnectionState::Closed);
                            return;
                        }
                        SessionEnd::Dropped(reason) => {
                            if self.closed_gracefully.load(Ordering::SeqCst) {
                                self.core.transition(ConnectionState::Closed);
                                return;
                            }
                            warn!(connection_id = %id, %reason, "websocket dropped");
                        }
                    }
                }
                Err(e) => {
                    if let Some(tx) = first.take() {
                        self.core.transition(ConnectionState::Failed);
                        let _ = tx.send(Err(e));
                        return;
                    }
                    warn!(connection_id = %id, error = %e, attempt, "websocket reconnect attempt failed");
                }
            }

            attempt += 1;
            if !self.core.transition(ConnectionState::Reconnecting) {
                return;
            }
            metrics().reconnect_attempts.add(1, &[KeyValue::new("transport", "WEBSOCKET")]);
            if !self.policy.should_retry(attempt) {
                error!(target: "io_event", connection_id = %id, attempt, "websocket reconnect attempts exhausted");
                self.core.transition(ConnectionState::Failed);
                return;
            }
            let delay = self
                .policy
                .delay_for(attempt)
                .unwrap_or_else(|_| Duration::from_millis(self.policy.initial_delay_ms));
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

    async fn run_session(&self, stream: WsStream) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().await = Some(out_tx);

        let mut ping = self.keep_alive.is_enabled().then(|| {
            let every = self.keep_alive.ping_interval();
            tokio::time::interval_at(Instant::now() + every, every)
        });
        let mut pong_deadline: Option<Instant> = None;

        let end = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(normal_closure()).await;
                    break SessionEnd::Shutdown;
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !self.core.emit(text.as_str().as_bytes().to_vec(), FrameType::Text).await {
                            break SessionEnd::Shutdown;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if !self.core.emit(bytes.to_vec(), FrameType::Binary).await {
                            break SessionEnd::Shutdown;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => pong_deadline = None,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Dropped(format!("closed by peer: {frame:?}"));
                    }
                    Some(Err(e)) => break SessionEnd::Dropped(e.to_string()),
                    None => break SessionEnd::Dropped("stream ended".into()),
                },
                outgoing = out_rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = write.send(message).await {
                            break SessionEnd::Dropped(e.to_string());
                        }
                    }
                    None => break SessionEnd::Shutdown,
                },
                _ = tick_opt(&mut ping) => {
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.keep_alive.pong_timeout());
                    }
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        break SessionEnd::Dropped(e.to_string());
                    }
                }
                _ = sleep_until_opt(pong_deadline) => {
                    break SessionEnd::Dropped("pong timeout".into());
                }
            }
        };

        self.outbound.lock().await.take();
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::handle::ConnectionType;
    use channel_plugin::ChannelId;

    fn handle(url: &str) -> ConnectionHandle {
        ConnectionHandle::new(
            ConnectionType::WebSocket,
            ChannelId::new("acme.ws").unwrap(),
            Some(url.to_string()),
        )
        .unwrap()
    }

    #[test]
    fn rejects_non_websocket_urls_and_bad_headers() {
        let bad_scheme = WebSocketConnection::new(
            handle("http://example.test"),
            vec![],
            ReconnectPolicy::NONE,
            KeepAliveConfig::DISABLED,
        );
        assert!(matches!(bad_scheme, Err(IoError::InvalidInput(_))));

        let bad_header = WebSocketConnection::new(
            handle("ws://example.test"),
            vec![("bad header".into(), "x".into())],
            ReconnectPolicy::NONE,
            KeepAliveConfig::DISABLED,
        );
        assert!(matches!(bad_header, Err(IoError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn failed_first_connect_fails_open() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ws = WebSocketConnection::new(
            handle(&format!("ws://{addr}")),
            vec![],
            ReconnectPolicy::DEFAULT,
            KeepAliveConfig::DISABLED,
        )
        .unwrap();
        let err = ws.open().await.unwrap_err();
        assert!(matches!(err, IoError::Connect { .. }));
        assert_eq!(ws.handle().state(), ConnectionState::Failed);
        assert!(ws.send(vec![1]).await.is_err());
    }
}
