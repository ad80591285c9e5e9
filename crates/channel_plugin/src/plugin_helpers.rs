//! Helpers to construct `ChannelMessage`s and move them across byte-oriented transports.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::message::*;
use crate::plugin::PluginError;

// -----------------------------------------------------------------------------
// Message builders
// -----------------------------------------------------------------------------

pub fn build_text_message(
    channel_id: &ChannelId,
    session_id: &SessionId,
    direction: MessageDirection,
    body: &str,
) -> ChannelMessage {
    ChannelMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.clone(),
        channel_id: channel_id.clone(),
        direction,
        content: MessageContent::text(body),
        reply_to_id: None,
        timestamp: Utc::now(),
        metadata: HashMap::new(),
    }
}

pub fn build_reply(original: &ChannelMessage, body: &str) -> ChannelMessage {
    let mut reply = build_text_message(
        &original.channel_id,
        &original.session_id,
        MessageDirection::Outbound,
        body,
    );
    reply.reply_to_id = Some(original.id.clone());
    reply
}

pub fn build_event_message(
    channel_id: &ChannelId,
    session_id: &SessionId,
    event_type: &str,
    payload: serde_json::Value,
) -> ChannelMessage {
    ChannelMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.clone(),
        channel_id: channel_id.clone(),
        direction: MessageDirection::Inbound,
        content: MessageContent::event(event_type, payload),
        reply_to_id: None,
        timestamp: Utc::now(),
        metadata: HashMap::new(),
    }
}

// -----------------------------------------------------------------------------
// Wire helpers
// -----------------------------------------------------------------------------

/// Serializes a message to its JSON wire form.
pub fn encode_message(message: &ChannelMessage) -> Result<Vec<u8>, PluginError> {
    Ok(serde_json::to_vec(message)?)
}

/// Parses and validates a message received as JSON bytes.
pub fn decode_message(bytes: &[u8]) -> Result<ChannelMessage, PluginError> {
    let message: ChannelMessage = serde_json::from_slice(bytes)?;
    message.validate()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_points_at_original() {
        let channel = ChannelId::new("acme.sms").unwrap();
        let session = SessionId::new("s-1");
        let inbound = build_text_message(&channel, &session, MessageDirection::Inbound, "ping");
        let reply = build_reply(&inbound, "pong");

        assert_eq!(reply.reply_to_id.as_deref(), Some(inbound.id.as_str()));
        assert_eq!(reply.direction, MessageDirection::Outbound);
        assert_eq!(reply.session_id, session);
        assert_ne!(reply.id, inbound.id);
    }

    #[test]
    fn event_messages_are_inbound() {
        let channel = ChannelId::new("acme.sms").unwrap();
        let msg = build_event_message(&channel, &SessionId::new("s"), "typing", serde_json::json!({"user": "u1"}));
        assert_eq!(msg.direction, MessageDirection::Inbound);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn decode_rejects_invalid_content() {
        let channel = ChannelId::new("acme.sms").unwrap();
        let mut msg = build_text_message(&channel, &SessionId::new("s"), MessageDirection::Inbound, "x");
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), msg);

        msg.content = MessageContent::text("");
        let bytes = encode_message(&msg).unwrap();
        assert!(matches!(decode_message(&bytes), Err(PluginError::InvalidInput(_))));
        assert!(matches!(decode_message(b"{nope"), Err(PluginError::Json(_))));
    }
}
