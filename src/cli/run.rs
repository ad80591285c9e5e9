use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use channel_host::channel::{ChannelBridge, ChannelEvent, ChannelRegistry, IoChannelBridge};
use channel_host::config::MapConfigStore;
use channel_host::io::{
    InboundMessageQueue, IoConnectionManager, IoMessageDispatcher, NotifyRuntimeWaker, ReqwestHttpClient,
};
use channel_host::logger::init_tracing;
use channel_host::session::{InMemorySessionStore, Session, SessionState, SessionStore};
use channel_plugin::plugin_helpers::{build_reply, build_text_message};
use channel_plugin::{
    ChannelAuthType, ChannelExtension, ChannelId, ChannelMessage, ChannelMetadata, ChannelState, ConnectionEvent,
    MessageContent, MessageDirection, PluginError, SessionId,
};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::CliContext;

const CONSOLE_CHANNEL: &str = "local.console";
const CONSOLE_SESSION: &str = "console";
const GUEST_QUEUE: usize = 64;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Seconds a session may stay idle before it is forgotten
    #[arg(long, default_value = "1800")]
    pub session_timeout: u64,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    pub otel_endpoint: Option<String>,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            session_timeout: 1800,
            log_level: None,
            otel_endpoint: None,
        }
    }
}

/// What the in-process guest asks the host to do.
enum GuestSignal {
    Inbound(ChannelMessage),
    Outbound(ChannelMessage),
}

/// Guest side of the console channel: turns pipe bytes into messages and
/// hands outbound messages back to the host loop for delivery.
struct ConsoleExtension {
    channel_id: ChannelId,
    session_id: SessionId,
    signals: mpsc::Sender<GuestSignal>,
}

#[async_trait]
impl ChannelExtension for ConsoleExtension {
    async fn deliver(&self, connection_id: &str, data: Vec<u8>) {
        let text = String::from_utf8_lossy(&data);
        let message = build_text_message(&self.channel_id, &self.session_id, MessageDirection::Inbound, text.trim());
        if self.signals.send(GuestSignal::Inbound(message)).await.is_err() {
            warn!(connection_id, "console host loop is gone, dropping input");
        }
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        info!(?event, "console connection event");
    }

    async fn send_outbound(&self, message: ChannelMessage) -> Result<(), PluginError> {
        self.signals
            .send(GuestSignal::Outbound(message))
            .await
            .map_err(|_| PluginError::Other("console host loop stopped".into()))
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut log_config = context.config.log_config();
    if let Some(level) = args.log_level {
        log_config.log_level = level;
    }
    if args.otel_endpoint.is_some() {
        log_config.otel_endpoint = args.otel_endpoint;
    }
    let _telemetry = init_tracing(&log_config)?;
    context.config.log_env_file();

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_millis(context.config.http_timeout_ms))
        .build()
        .context("could not build HTTP client")?;
    let manager = Arc::new(IoConnectionManager::new(
        Arc::new(ReqwestHttpClient::with_client(http_client)),
        Arc::new(MapConfigStore::new()),
    ));
    let queue = Arc::new(InboundMessageQueue::new(context.config.queue_capacity)?);
    let waker = Arc::new(NotifyRuntimeWaker::new());
    let sessions = InMemorySessionStore::new(Duration::from_secs(args.session_timeout));
    let dispatcher = Arc::new(IoMessageDispatcher::new(queue.clone(), waker.clone(), sessions.clone()));
    let registry = ChannelRegistry::new();

    let channel_id = ChannelId::new(CONSOLE_CHANNEL)?;
    let (signals_tx, mut guest_signals) = mpsc::channel(GUEST_QUEUE);
    let extension = ConsoleExtension {
        channel_id: channel_id.clone(),
        session_id: SessionId::from(CONSOLE_SESSION),
        signals: signals_tx,
    };
    let bridge = Arc::new(IoChannelBridge::new(
        channel_id.clone(),
        manager.clone(),
        Arc::new(extension),
        Some(dispatcher),
    ));
    let metadata = ChannelMetadata::new(
        channel_id.clone(),
        "Console",
        "Echoes every line typed on stdin",
        ChannelAuthType::None,
    )?;
    registry.register(metadata, bridge.clone()).await?;

    let session = Session::new(channel_id.clone(), CONSOLE_SESSION)?;
    registry.publish(ChannelEvent::SessionCreated {
        session_id: session.id.clone(),
        channel_id: channel_id.clone(),
    });
    let session = session.with_state(SessionState::Active)?;
    sessions.save(session.clone()).await;
    registry.publish(ChannelEvent::SessionStateChanged {
        session_id: session.id.clone(),
        channel_id: channel_id.clone(),
        new_state: session.state,
    });

    let (pipe, mut peer) = bridge.open_pipe().await?;
    for state in [ChannelState::Connecting, ChannelState::Authenticating, ChannelState::Connected] {
        bridge.report_state_change(state, None).await?;
    }
    info!(channel_id = %channel_id, "console channel ready, type a line");

    let mut events = registry.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => peer.push_text(&line).await?,
                Some(_) => {}
                None => break,
            },
            Some(guest) = guest_signals.recv() => match guest {
                GuestSignal::Inbound(message) => bridge.emit_inbound_message(message).await?,
                GuestSignal::Outbound(message) => {
                    let body = match &message.content {
                        MessageContent::Text { body } => body.clone(),
                        other => serde_json::to_string(other)?,
                    };
                    let result = bridge.send_text(pipe.id(), &body).await;
                    let reason = result.as_ref().err().map(|e| e.to_string());
                    bridge.notify_outbound_result(&message.id, result.is_ok(), reason).await?;
                }
            },
            wakes = waker.next_wakes() => {
                for (session_id, _) in wakes {
                    for message in queue.drain(&session_id) {
                        if let MessageContent::Text { body } = &message.content {
                            bridge.send_message(build_reply(&message, &format!("echo: {body}"))).await?;
                        }
                    }
                }
            }
            Some(frame) = peer.recv() => println!("{}", frame.payload_as_text()),
            Ok(event) = events.recv() => debug!(?event, "channel event"),
        }
    }

    registry.shutdown().await;
    manager.shutdown().await;
    info!("channel host stopped");
    Ok(())
}
