use std::{borrow::Cow, collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::plugin::PluginError;

static CHANNEL_ID_PATTERN: &str = r"^[a-z0-9_-]+\.[a-z0-9_-]+$";
static CHANNEL_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(CHANNEL_ID_PATTERN).unwrap_or_else(|_| unreachable!("static channel id pattern"))
});

/// Identity of a channel, which is also the identity of the extension backing it.
///
/// Always of the form `author.name`, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Result<Self, PluginError> {
        let value = value.into();
        if !CHANNEL_ID_RE.is_match(&value) {
            return Err(PluginError::InvalidInput(format!(
                "invalid channel id '{value}': expected author.name"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn author(&self) -> &str {
        self.0.split_once('.').map(|(author, _)| author).unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('.').map(|(_, name)| name).unwrap_or(&self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelId {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl JsonSchema for ChannelId {
    fn schema_name() -> Cow<'static, str> {
        "ChannelId".into()
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "string",
            "pattern": CHANNEL_ID_PATTERN,
        })
    }
}

/// Host-side identifier of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

/// One logical message travelling through a channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelMessage {
    pub id: String,
    pub session_id: SessionId,
    pub channel_id: ChannelId,
    pub direction: MessageDirection,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ChannelMessage {
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.id.trim().is_empty() {
            return Err(PluginError::InvalidInput("message id must not be blank".into()));
        }
        if self.timestamp.timestamp_millis() <= 0 {
            return Err(PluginError::InvalidInput("message timestamp must be positive".into()));
        }
        self.content.validate()
    }
}

fn default_image_mime() -> String {
    "image/jpeg".into()
}

fn default_audio_mime() -> String {
    "audio/ogg".into()
}

fn default_video_mime() -> String {
    "video/mp4".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Image {
        blob_uri: String,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default = "default_image_mime")]
        mime_type: String,
    },
    Audio {
        blob_uri: String,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default = "default_audio_mime")]
        mime_type: String,
    },
    Video {
        blob_uri: String,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default = "default_video_mime")]
        mime_type: String,
    },
    File {
        blob_uri: String,
        file_name: String,
        mime_type: String,
    },
    Reaction {
        emoji: String,
        target_message_id: String,
    },
    Deletion {
        target_message_id: String,
    },
    Event {
        event_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text { body: body.into() }
    }

    pub fn image(blob_uri: impl Into<String>, caption: Option<String>) -> Self {
        MessageContent::Image {
            blob_uri: blob_uri.into(),
            caption,
            mime_type: default_image_mime(),
        }
    }

    pub fn audio(blob_uri: impl Into<String>, duration_ms: Option<u64>) -> Self {
        MessageContent::Audio {
            blob_uri: blob_uri.into(),
            duration_ms,
            mime_type: default_audio_mime(),
        }
    }

    pub fn video(blob_uri: impl Into<String>, caption: Option<String>, duration_ms: Option<u64>) -> Self {
        MessageContent::Video {
            blob_uri: blob_uri.into(),
            caption,
            duration_ms,
            mime_type: default_video_mime(),
        }
    }

    pub fn event(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        MessageContent::Event {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Checks the per-variant required fields.
    pub fn validate(&self) -> Result<(), PluginError> {
        fn require(ok: bool, what: &str) -> Result<(), PluginError> {
            if ok {
                Ok(())
            } else {
                Err(PluginError::InvalidInput(format!("{what} must not be blank")))
            }
        }

        match self {
            MessageContent::Text { body } => require(!body.is_empty(), "text body"),
            MessageContent::Image { blob_uri, .. }
            | MessageContent::Audio { blob_uri, .. }
            | MessageContent::Video { blob_uri, .. } => require(!blob_uri.trim().is_empty(), "blob uri"),
            MessageContent::File { blob_uri, file_name, .. } => {
                require(!blob_uri.trim().is_empty(), "blob uri")?;
                require(!file_name.trim().is_empty(), "file name")
            }
            MessageContent::Reaction { emoji, target_message_id } => {
                require(!emoji.trim().is_empty(), "reaction emoji")?;
                require(!target_message_id.trim().is_empty(), "reaction target message id")
            }
            MessageContent::Deletion { target_message_id } => {
                require(!target_message_id.trim().is_empty(), "deletion target message id")
            }
            MessageContent::Event { event_type, .. } => require(!event_type.trim().is_empty(), "event type"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString, EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelAuthType {
    None,
    Token,
    QrCode,
    #[serde(rename = "OAUTH2")]
    #[strum(serialize = "OAUTH2")]
    OAuth2,
    PhoneOtp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString, EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelCapability {
    Text,
    Images,
    Audio,
    Video,
    Files,
    Reactions,
    ReplyThread,
    Presence,
    ReadReceipts,
    HistorySync,
}

/// Static declaration of a channel, provided by its extension at install time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelMetadata {
    pub channel_id: ChannelId,
    pub display_name: String,
    pub description: String,
    #[serde(default)]
    pub icon_blob_id: Option<String>,
    #[serde(default)]
    pub supports_multiple_sessions: bool,
    pub auth_type: ChannelAuthType,
    #[serde(default)]
    pub capabilities: Vec<ChannelCapability>,
}

impl ChannelMetadata {
    pub fn new(
        channel_id: ChannelId,
        display_name: impl Into<String>,
        description: impl Into<String>,
        auth_type: ChannelAuthType,
    ) -> Result<Self, PluginError> {
        let metadata = Self {
            channel_id,
            display_name: display_name.into(),
            description: description.into(),
            icon_blob_id: None,
            supports_multiple_sessions: true,
            auth_type,
            capabilities: vec![ChannelCapability::Text],
        };
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = ChannelCapability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        if self.display_name.trim().is_empty() {
            return Err(PluginError::InvalidInput("display name must not be blank".into()));
        }
        if self.description.trim().is_empty() {
            return Err(PluginError::InvalidInput("description must not be blank".into()));
        }
        Ok(())
    }

    pub fn supports(&self, capability: ChannelCapability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn channel_id_requires_author_and_name() {
        let id = ChannelId::new("acme.telegram").unwrap();
        assert_eq!(id.author(), "acme");
        assert_eq!(id.name(), "telegram");

        assert!(ChannelId::new("telegram").is_err());
        assert!(ChannelId::new("Acme.Telegram").is_err());
        assert!(ChannelId::new("acme.tele.gram").is_err());
        assert!("".parse::<ChannelId>().is_err());
    }

    #[test]
    fn channel_id_deserialization_is_validated() {
        let ok: ChannelId = serde_json::from_str("\"acme.sms\"").unwrap();
        assert_eq!(ok.as_str(), "acme.sms");
        assert!(serde_json::from_str::<ChannelId>("\"not valid\"").is_err());
    }

    #[test]
    fn content_validation_checks_variant_fields() {
        assert!(MessageContent::text("hi").validate().is_ok());
        assert!(MessageContent::text("").validate().is_err());
        assert!(
            MessageContent::File {
                blob_uri: "blob://1".into(),
                file_name: " ".into(),
                mime_type: "text/plain".into(),
            }
            .validate()
            .is_err()
        );
        assert!(
            MessageContent::Reaction {
                emoji: "👍".into(),
                target_message_id: "".into(),
            }
            .validate()
            .is_err()
        );
        assert!(MessageContent::event("typing", serde_json::Value::Null).validate().is_ok());
        assert!(MessageContent::event("", serde_json::Value::Null).validate().is_err());
    }

    #[test]
    fn media_defaults_apply_on_deserialize() {
        let content: MessageContent =
            serde_json::from_str(r#"{"kind":"image","blob_uri":"blob://7"}"#).unwrap();
        assert_eq!(content, MessageContent::image("blob://7", None));

        let content: MessageContent =
            serde_json::from_str(r#"{"kind":"audio","blob_uri":"blob://8"}"#).unwrap();
        match content {
            MessageContent::Audio { mime_type, .. } => assert_eq!(mime_type, "audio/ogg"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_validation_rejects_blank_id_and_epoch_zero() {
        let mut msg = ChannelMessage {
            id: "m1".into(),
            session_id: SessionId::new("s1"),
            channel_id: ChannelId::new("acme.sms").unwrap(),
            direction: MessageDirection::Inbound,
            content: MessageContent::text("hello"),
            reply_to_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        };
        assert!(msg.validate().is_ok());

        msg.id = "  ".into();
        assert!(msg.validate().is_err());

        msg.id = "m1".into();
        msg.timestamp = Utc.timestamp_millis_opt(0).unwrap();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn metadata_requires_name_and_description() {
        let id = ChannelId::new("acme.sms").unwrap();
        assert!(ChannelMetadata::new(id.clone(), "SMS", "Text messages", ChannelAuthType::Token).is_ok());
        assert!(ChannelMetadata::new(id.clone(), " ", "Text messages", ChannelAuthType::Token).is_err());
        assert!(ChannelMetadata::new(id, "SMS", "", ChannelAuthType::Token).is_err());
    }

    #[test]
    fn auth_type_names_match_wire_form() {
        assert_eq!(ChannelAuthType::OAuth2.to_string(), "OAUTH2");
        assert_eq!(ChannelAuthType::QrCode.to_string(), "QR_CODE");
        assert_eq!(serde_json::to_string(&ChannelAuthType::PhoneOtp).unwrap(), "\"PHONE_OTP\"");
        assert_eq!(serde_json::to_string(&ChannelAuthType::OAuth2).unwrap(), "\"OAUTH2\"");
    }
}
