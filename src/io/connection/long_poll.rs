use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigField, ConfigStore, StorageScope};
use crate::io::connection::{ConnectionCore, FrameReceiver, IoConnection};
use crate::io::error::IoError;
use crate::io::frame::FrameType;
use crate::io::handle::{ConnectionHandle, ConnectionState};
use crate::io::http::{HttpClient, HttpRequest};

pub const CURSOR_PLACEHOLDER: &str = "{cursor}";
pub const MAX_BACKOFF_MS: u64 = 60_000;

fn default_interval_ms() -> u64 {
    5_000
}

fn default_cursor_key() -> String {
    "poll_cursor".into()
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongPollConfig {
    /// May contain `{cursor}`, replaced by the stored cursor on every request.
    pub url: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_cursor_key")]
    pub cursor_key: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// JSON pointer into the response body locating the next cursor, if the
    /// transport should persist it itself.
    #[serde(default)]
    pub next_cursor_pointer: Option<String>,
}

impl LongPollConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            interval_ms: default_interval_ms(),
            cursor_key: default_cursor_key(),
            headers: Vec::new(),
            timeout_ms: default_timeout_ms(),
            next_cursor_pointer: None,
        }
    }

    pub fn interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn next_cursor_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.next_cursor_pointer = Some(pointer.into());
        self
    }

    pub fn validate(&self) -> Result<(), IoError> {
        if self.url.trim().is_empty() {
            return Err(IoError::InvalidInput("long-poll url must not be blank".into()));
        }
        if self.interval_ms == 0 {
            return Err(IoError::InvalidInput("long-poll interval must be positive".into()));
        }
        if self.timeout_ms == 0 {
            return Err(IoError::InvalidInput("long-poll timeout must be positive".into()));
        }
        if self.cursor_key.trim().is_empty() {
            return Err(IoError::InvalidInput("long-poll cursor key must not be blank".into()));
        }
        Ok(())
    }

    /// Without a cursor the url is returned as configured, placeholder included.
    pub fn resolved_url(&self, cursor: Option<&str>) -> String {
        match cursor {
            Some(cursor) => self.url.replace(CURSOR_PLACEHOLDER, cursor),
            None => self.url.clone(),
        }
    }
}

struct PollShared {
    core: Arc<ConnectionCore>,
    config: LongPollConfig,
    scope: StorageScope,
    cursor_field: ConfigField,
    http: Arc<dyn HttpClient>,
    store: Arc<dyn ConfigStore>,
    shutdown: CancellationToken,
}

/// Receive-only transport: repeated GETs against a cursor-bearing URL.
pub struct LongPollConnection {
    inner: Arc<PollShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LongPollConnection {
    pub fn new(
        handle: ConnectionHandle,
        config: LongPollConfig,
        http: Arc<dyn HttpClient>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self, IoError> {
        config.validate()?;
        let scope = StorageScope::Extension(handle.channel_id().clone());
        let cursor_field = ConfigField::new(config.cursor_key.clone());
        Ok(Self {
            inner: Arc::new(PollShared {
                core: Arc::new(ConnectionCore::new(handle)),
                config,
                scope,
                cursor_field,
                http,
                store,
                shutdown: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl IoConnection for LongPollConnection {
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
        self.inner.core.try_transition(ConnectionState::Connected)?;
        info!(target: "io_event", connection_id = %self.inner.core.id(), url = %self.inner.config.url, "long-poll started");
        let inner = self.inner.clone();
        *self.task.lock().await = Some(tokio::spawn(async move { inner.poll_loop().await }));
        Ok(())
    }

    async fn send(&self, _data: Vec<u8>) -> Result<(), IoError> {
        Err(IoError::Unsupported(
            "long-poll connections are receive-only; use the HTTP client for outbound calls".into(),
        ))
    }

    async fn send_text(&self, _text: &str) -> Result<(), IoError> {
        self.send(Vec::new()).await
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.inner.core.transition(ConnectionState::Closed);
    }
}

enum PollOutcome {
    Data(Vec<u8>),
    Empty,
    Failed(String),
}

impl PollShared {
    async fn poll_loop(self: Arc<Self>) {
        let id = self.core.id();
        let interval = self.config.interval_ms;
        let mut backoff = interval;

        while self.core.state() == ConnectionState::Connected && !self.shutdown.is_cancelled() {
            let wait = match self.poll_once().await {
                PollOutcome::Data(body) => {
                    backoff = interval;
                    if !self.core.emit(body, FrameType::Binary).await {
                        return;
                    }
                    interval
                }
                PollOutcome::Empty => interval,
                PollOutcome::Failed(reason) => {
                    let wait = backoff;
                    backoff = (backoff.saturating_mul(2)).min(MAX_BACKOFF_MS);
                    warn!(connection_id = %id, %reason, retry_in_ms = wait, "long-poll request failed");
                    wait
                }
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
            }
        }
    }

    async fn poll_once(&self) -> PollOutcome {
        let cursor = match self.store.get(&self.scope, &self.cursor_field).await {
            Ok(c) => c,
            Err(e) => return PollOutcome::Failed(format!("cursor lookup failed: {e}")),
        };
        let request = HttpRequest::get(self.config.resolved_url(cursor.as_deref()))
            .headers(self.config.headers.iter().cloned())
            .timeout_ms(self.config.timeout_ms);

        let response = tokio::select! {
            _ = self.shutdown.cancelled() => return PollOutcome::Empty,
            r = self.http.execute(request) => r,
        };
        match response {
            Ok(resp) if resp.is_success() => {
                if resp.body.is_empty() {
                    return PollOutcome::Empty;
                }
                self.store_next_cursor(&resp.body).await;
                PollOutcome::Data(resp.body)
            }
            Ok(resp) => PollOutcome::Failed(format!("HTTP {}", resp.status_code)),
            Err(e) => PollOutcome::Failed(e.to_string()),
        }
    }

    async fn store_next_cursor(&self, body: &[u8]) {
        let Some(pointer) = self.config.next_cursor_pointer.as_deref() else {
            return;
        };
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) else {
            return;
        };
        let next = match json.pointer(pointer) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return,
        };
        match self.store.set(&self.scope, &self.cursor_field, &next).await {
            Ok(()) => debug!(cursor = %next, "long-poll cursor advanced"),
            Err(e) => warn!(error = %e, "could not persist long-poll cursor"),
        }
    }
}
