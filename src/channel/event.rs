use channel_plugin::{AuthRequest, ChannelId, ChannelMessage, ChannelState, SessionId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::session::SessionState;

/// Everything a channel reports to the rest of the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    StateChanged {
        channel_id: ChannelId,
        previous: ChannelState,
        new: ChannelState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    MessageReceived {
        message: ChannelMessage,
    },
    MessageSent {
        message: ChannelMessage,
    },
    MessageSendFailed {
        session_id: SessionId,
        channel_id: ChannelId,
        reason: String,
    },
    SessionCreated {
        session_id: SessionId,
        channel_id: ChannelId,
    },
    SessionStateChanged {
        session_id: SessionId,
        channel_id: ChannelId,
        new_state: SessionState,
    },
    AuthRequired {
        channel_id: ChannelId,
        request: AuthRequest,
    },
}

impl ChannelEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            ChannelEvent::StateChanged { channel_id, .. }
            | ChannelEvent::MessageSendFailed { channel_id, .. }
            | ChannelEvent::SessionCreated { channel_id, .. }
            | ChannelEvent::SessionStateChanged { channel_id, .. }
            | ChannelEvent::AuthRequired { channel_id, .. } => channel_id,
            ChannelEvent::MessageReceived { message } | ChannelEvent::MessageSent { message } => &message.channel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_change_wire_shape() {
        let event = ChannelEvent::StateChanged {
            channel_id: ChannelId::new("acme.chat").unwrap(),
            previous: ChannelState::Connecting,
            new: ChannelState::Error,
            error_message: Some("bad token".into()),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "kind": "state_changed",
                "channel_id": "acme.chat",
                "previous": "CONNECTING",
                "new": "ERROR",
                "error_message": "bad token"
            })
        );
        assert_eq!(event.channel_id().as_str(), "acme.chat");
    }

    #[test]
    fn auth_required_nests_request() {
        let event = ChannelEvent::AuthRequired {
            channel_id: ChannelId::new("acme.chat").unwrap(),
            request: AuthRequest::token("Bot token"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "auth_required");
        assert_eq!(value["request"]["kind"], "token_entry");
        let back: ChannelEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
