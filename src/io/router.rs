use std::fmt;
use std::str::FromStr;

use channel_plugin::ChannelId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::error::IoError;

/// Host and port of an inbound peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteAddress {
    host: String,
    port: u16,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, IoError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(IoError::InvalidInput("remote host must not be blank".into()));
        }
        if port == 0 {
            return Err(IoError::InvalidInput("remote port must be in 1..=65535".into()));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for RemoteAddress {
    type Err = IoError;

    /// Parses `host:port`, splitting on the last colon so bare IPv6 hosts work.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| IoError::InvalidInput(format!("remote address '{s}' has no port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| IoError::InvalidInput(format!("bad port in '{s}': {e}")))?;
        Self::new(host.trim_start_matches('[').trim_end_matches(']'), port)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Maps accepted inbound peers to the channel that owns them.
#[derive(Debug, Default)]
pub struct InboundConnectionRouter {
    routes: DashMap<RemoteAddress, ChannelId>,
}

impl InboundConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `address` to `channel_id`, replacing any previous owner.
    pub fn register(&self, address: RemoteAddress, channel_id: ChannelId) {
        debug!(remote = %address, channel_id = %channel_id, "inbound route registered");
        if let Some(previous) = self.routes.insert(address.clone(), channel_id.clone()) {
            if previous != channel_id {
                debug!(remote = %address, from = %previous, to = %channel_id, "inbound route rebound");
            }
        }
    }

    pub fn unregister(&self, address: &RemoteAddress) -> Option<ChannelId> {
        self.routes.remove(address).map(|(_, channel)| channel)
    }

    pub fn resolve(&self, address: &RemoteAddress) -> Option<ChannelId> {
        self.routes.get(address).map(|entry| entry.value().clone())
    }

    pub fn active_connections(&self, channel_id: &ChannelId) -> Vec<RemoteAddress> {
        self.routes
            .iter()
            .filter(|entry| entry.value() == channel_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drops every route of `channel_id`; returns how many were removed.
    pub fn unregister_all(&self, channel_id: &ChannelId) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, owner| {
            if owner == channel_id {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }
}
