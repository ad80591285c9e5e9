use std::sync::Arc;
use std::time::Duration;

use channel_host::config::MapConfigStore;
use channel_host::io::{
    ConnectionState, FrameType, IoConnectionManager, IoError, KeepAliveConfig, ReconnectPolicy, ReqwestHttpClient,
};
use channel_plugin::ChannelId;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

const WAIT: Duration = Duration::from_secs(5);

fn manager() -> IoConnectionManager {
    IoConnectionManager::new(Arc::new(ReqwestHttpClient::new()), Arc::new(MapConfigStore::new()))
}

fn channel() -> ChannelId {
    ChannelId::new("acme.ws").unwrap()
}

/// What the test server observed.
#[derive(Debug)]
enum Seen {
    Header(Option<String>),
    Text(String),
    Close(Option<(u16, String)>),
}

/// Greets each client with a text and a binary frame, echoes text back and
/// reports everything it sees.
async fn echo_server() -> (String, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen_tx.clone();
            tokio::spawn(async move {
                let header_seen = seen.clone();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    let value = req
                        .headers()
                        .get("x-channel")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let _ = header_seen.send(Seen::Header(value));
                    Ok(resp)
                };
                let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
                ws.send(Message::text("hello")).await.unwrap();
                ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) => {
                            let _ = seen.send(Seen::Text(text.as_str().to_string()));
                            let _ = ws.send(Message::text(format!("echo:{}", text.as_str()))).await;
                        }
                        Message::Close(frame) => {
                            let _ = seen.send(Seen::Close(
                                frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string())),
                            ));
                            break;
                        }
                        _ => {}
                    }
                }
            });
        }
    });
    (url, seen_rx)
}

#[tokio::test]
async fn frames_arrive_in_order_and_text_round_trips() {
    let (url, mut seen) = echo_server().await;
    let mgr = manager();
    let handle = mgr
        .open_websocket(
            &channel(),
            &url,
            vec![("x-channel".into(), "acme.ws".into())],
            ReconnectPolicy::NONE,
            KeepAliveConfig::DISABLED,
        )
        .await
        .unwrap();
    assert_eq!(handle.state(), ConnectionState::Connected);

    match timeout(WAIT, seen.recv()).await.unwrap().unwrap() {
        Seen::Header(value) => assert_eq!(value.as_deref(), Some("acme.ws")),
        other => panic!("unexpected {other:?}"),
    }

    let mut frames = mgr.frames_of(&handle).unwrap();
    let first = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(first.frame_type, FrameType::Text);
    assert_eq!(first.payload_as_text(), "hello");
    let second = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(second.frame_type, FrameType::Binary);
    assert_eq!(second.payload, vec![1, 2, 3]);
    assert_eq!(second.connection_id, handle.id());

    mgr.send_text(&handle, "ping").await.unwrap();
    let echoed = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(echoed.payload_as_text(), "echo:ping");

    mgr.close(&handle).await.unwrap();
    assert!(mgr.state_of(&handle).is_none());
}

#[tokio::test]
async fn graceful_close_sends_normal_closure() {
    let (url, mut seen) = echo_server().await;
    let mgr = manager();
    let mut updates = mgr.connection_state_updates();
    let handle = mgr
        .open_websocket(&channel(), &url, vec![], ReconnectPolicy::DEFAULT, KeepAliveConfig::DISABLED)
        .await
        .unwrap();

    mgr.close(&handle).await.unwrap();

    let close = loop {
        match timeout(WAIT, seen.recv()).await.unwrap().unwrap() {
            Seen::Close(frame) => break frame,
            _ => continue,
        }
    };
    assert_eq!(close, Some((1000, "Normal closure".to_string())));

    let mut closed = 0;
    while let Ok(Ok(update)) = timeout(Duration::from_millis(200), updates.recv()).await {
        if update.state() == ConnectionState::Closed {
            closed += 1;
        }
        assert_ne!(update.state(), ConnectionState::Reconnecting);
    }
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn reconnects_after_server_drops_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        // first session: one frame, then an abrupt drop
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::text("first")).await.unwrap();
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::text("second")).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mgr = manager();
    let mut updates = mgr.connection_state_updates();
    let handle = mgr
        .open_websocket(&channel(), &url, vec![], ReconnectPolicy::FAST, KeepAliveConfig::DISABLED)
        .await
        .unwrap();
    let mut frames = mgr.frames_of(&handle).unwrap();

    let first = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload_as_text(), "first");
    let second = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(second.payload_as_text(), "second");

    let mut states = Vec::new();
    while let Ok(Ok(update)) = timeout(Duration::from_millis(200), updates.recv()).await {
        states.push(update.state());
    }
    let reconnecting = states
        .iter()
        .position(|s| *s == ConnectionState::Reconnecting)
        .expect("a reconnect was reported");
    assert!(states[reconnecting..].contains(&ConnectionState::Connected));
    assert_eq!(mgr.state_of(&handle), Some(ConnectionState::Connected));

    mgr.close(&handle).await.unwrap();
}

#[tokio::test]
async fn failed_first_connect_fails_open() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let mgr = manager();
    let err = mgr
        .open_websocket(&channel(), &url, vec![], ReconnectPolicy::DEFAULT, KeepAliveConfig::DISABLED)
        .await
        .unwrap_err();
    assert!(matches!(err, IoError::Connect { .. }));
    assert!(mgr.connections_of(&channel()).is_empty());

    let err = mgr
        .open_websocket(&channel(), "http://example.org", vec![], ReconnectPolicy::NONE, KeepAliveConfig::DISABLED)
        .await
        .unwrap_err();
    assert!(matches!(err, IoError::InvalidInput(_)));
}
