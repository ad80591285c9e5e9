use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    message::ChannelMessage,
    plugin::{ChannelExtension, ConnectionEvent, PluginError},
};

/// Records everything the host hands to an extension.
#[derive(Clone, Default)]
pub struct MockExtension {
    deliveries: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
    outbound: Arc<Mutex<Vec<ChannelMessage>>>,
    fail_outbound: Arc<Mutex<Option<String>>>,
}

impl MockExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `send_outbound` fail with `reason`.
    pub async fn fail_outbound_with(&self, reason: &str) {
        *self.fail_outbound.lock().await = Some(reason.to_string());
    }

    pub async fn deliveries(&self) -> Vec<(String, Vec<u8>)> {
        self.deliveries.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().await.clone()
    }

    pub async fn outbound(&self) -> Vec<ChannelMessage> {
        self.outbound.lock().await.clone()
    }

    /// Polls until at least `n` deliveries arrived or `timeout` elapsed.
    pub async fn wait_for_deliveries(&self, n: usize, timeout: Duration) -> Vec<(String, Vec<u8>)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.deliveries().await;
            if current.len() >= n || tokio::time::Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Polls until an event matching `pred` was recorded.
    pub async fn wait_for_event<F>(&self, pred: F, timeout: Duration) -> Option<ConnectionEvent>
    where
        F: Fn(&ConnectionEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(ev) = self.events().await.into_iter().find(|e| pred(e)) {
                return Some(ev);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl ChannelExtension for MockExtension {
    async fn deliver(&self, connection_id: &str, data: Vec<u8>) {
        self.deliveries.lock().await.push((connection_id.to_string(), data));
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        self.events.lock().await.push(event);
    }

    async fn send_outbound(&self, message: ChannelMessage) -> Result<(), PluginError> {
        if let Some(reason) = self.fail_outbound.lock().await.clone() {
            return Err(PluginError::Other(reason));
        }
        self.outbound.lock().await.push(message);
        Ok(())
    }
}
