use channel_plugin::ChannelId;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use uuid::Uuid;

use crate::io::error::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    #[serde(rename = "WEBSOCKET")]
    #[strum(serialize = "WEBSOCKET")]
    WebSocket,
    Tcp,
    LongPoll,
    Pipe,
    Http,
}

impl ConnectionType {
    /// Pipes are in-process and plain HTTP calls are not tied to a remote peer.
    pub fn requires_remote_address(self) -> bool {
        !matches!(self, ConnectionType::Pipe | ConnectionType::Http)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match self {
            Idle => matches!(next, Connecting | Closed),
            Connecting => matches!(next, Connected | Reconnecting | Failed | Closed),
            Connected => matches!(next, Reconnecting | Closed | Failed),
            Reconnecting => matches!(next, Connecting | Closed | Failed),
            Closed | Failed => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// By-value snapshot of one managed connection.
///
/// Handles are cheap to clone and never refer back to the transport; only the
/// owning connection produces new snapshots through [`ConnectionHandle::with_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHandle {
    id: String,
    connection_type: ConnectionType,
    channel_id: ChannelId,
    remote_address: Option<String>,
    state: ConnectionState,
}

impl ConnectionHandle {
    pub fn new(
        connection_type: ConnectionType,
        channel_id: ChannelId,
        remote_address: Option<String>,
    ) -> Result<Self, IoError> {
        let remote_address = remote_address.filter(|a| !a.trim().is_empty());
        if connection_type.requires_remote_address() && remote_address.is_none() {
            return Err(IoError::InvalidInput(format!(
                "{connection_type} connection requires a remote address"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            connection_type,
            channel_id,
            remote_address,
            state: ConnectionState::Idle,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn with_state(&self, next: ConnectionState) -> Result<Self, IoError> {
        if !self.state.can_transition_to(next) {
            return Err(IoError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        Ok(Self {
            state: next,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn channel() -> ChannelId {
        ChannelId::new("acme.chat").unwrap()
    }

    #[test]
    fn adjacency_matches_table() {
        use ConnectionState::*;
        let table = [
            (Idle, vec![Connecting, Closed]),
            (Connecting, vec![Connected, Reconnecting, Failed, Closed]),
            (Connected, vec![Reconnecting, Closed, Failed]),
            (Reconnecting, vec![Connecting, Closed, Failed]),
            (Closed, vec![]),
            (Failed, vec![]),
        ];
        for (from, allowed) in table {
            for to in ConnectionState::iter() {
                assert_eq!(from.can_transition_to(to), allowed.contains(&to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn remote_address_rule() {
        assert!(ConnectionHandle::new(ConnectionType::WebSocket, channel(), None).is_err());
        assert!(ConnectionHandle::new(ConnectionType::Tcp, channel(), Some("  ".into())).is_err());
        assert!(ConnectionHandle::new(ConnectionType::Pipe, channel(), None).is_ok());
        assert!(ConnectionHandle::new(ConnectionType::Http, channel(), None).is_ok());
        let h = ConnectionHandle::new(ConnectionType::LongPoll, channel(), Some("https://x".into())).unwrap();
        assert_eq!(h.state(), ConnectionState::Idle);
        assert_eq!(h.remote_address(), Some("https://x"));
    }

    #[test]
    fn with_state_is_validated_copy() {
        let h = ConnectionHandle::new(ConnectionType::Pipe, channel(), None).unwrap();
        let connecting = h.with_state(ConnectionState::Connecting).unwrap();
        assert_eq!(connecting.id(), h.id());
        assert_eq!(h.state(), ConnectionState::Idle);

        let err = connecting.with_state(ConnectionState::Idle).unwrap_err();
        assert!(matches!(err, IoError::InvalidTransition { .. }));

        let closed = connecting.with_state(ConnectionState::Closed).unwrap();
        assert!(closed.state().is_terminal());
        assert!(closed.with_state(ConnectionState::Connecting).is_err());
    }
}
