use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::message::ChannelMessage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("extension error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        PluginError::Json(e.to_string())
    }
}

/// Lifecycle of a channel as seen by the host.
///
/// This is distinct from a connection's state: a channel may go through a
/// platform auth handshake, and it outlives any single transport connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    Unregistered,
    Registered,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

impl ChannelState {
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        match self {
            Unregistered => next == Registered,
            Registered => matches!(next, Connecting | Unregistered),
            Connecting => matches!(next, Authenticating | Disconnected | Error),
            Authenticating => matches!(next, Connected | Disconnected | Error),
            Connected => matches!(next, Reconnecting | Disconnected | Error),
            Reconnecting => matches!(next, Connected | Disconnected | Error),
            Disconnected => matches!(next, Connecting | Unregistered),
            Error => next == Unregistered,
        }
    }
}

fn default_phone_prompt() -> String {
    "Enter your phone number".into()
}

fn default_is_password() -> bool {
    true
}

/// A request from an extension for the user to authenticate the channel.
/// Only ever surfaced to the UI through `AuthRequired` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthRequest {
    QrCode {
        data_uri: String,
        #[serde(default)]
        expires_at: Option<i64>,
    },
    TokenEntry {
        prompt: String,
        #[serde(default = "default_is_password")]
        is_password: bool,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        authorization_url: String,
        redirect_scheme: String,
    },
    PhoneOtp {
        #[serde(default = "default_phone_prompt")]
        prompt: String,
        #[serde(default)]
        country_code_hint: Option<String>,
    },
}

impl AuthRequest {
    pub fn token(prompt: impl Into<String>) -> Self {
        AuthRequest::TokenEntry {
            prompt: prompt.into(),
            is_password: true,
        }
    }

    pub fn phone_otp(country_code_hint: Option<String>) -> Self {
        AuthRequest::PhoneOtp {
            prompt: default_phone_prompt(),
            country_code_hint,
        }
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        let blank = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(PluginError::InvalidInput(format!("{field} must not be blank")))
            } else {
                Ok(())
            }
        };
        match self {
            AuthRequest::QrCode { data_uri, .. } => blank("data_uri", data_uri),
            AuthRequest::TokenEntry { prompt, .. } => blank("prompt", prompt),
            AuthRequest::OAuth2 {
                authorization_url,
                redirect_scheme,
            } => {
                blank("authorization_url", authorization_url)?;
                blank("redirect_scheme", redirect_scheme)
            }
            AuthRequest::PhoneOtp { .. } => Ok(()),
        }
    }
}

/// Transport lifecycle notifications handed to the extension, keyed by connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Opened { connection_id: String },
    Closed { connection_id: String, code: u16, reason: String },
    Error { connection_id: String, message: String },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            ConnectionEvent::Opened { connection_id }
            | ConnectionEvent::Closed { connection_id, .. }
            | ConnectionEvent::Error { connection_id, .. } => connection_id,
        }
    }
}

/// The guest side of a channel: whatever runtime hosts the extension code.
///
/// The host pushes raw transport data and connection events in, and hands
/// outbound messages over for the extension to perform the platform call.
#[async_trait]
pub trait ChannelExtension: Send + Sync + 'static {
    async fn deliver(&self, connection_id: &str, data: Vec<u8>);

    async fn on_connection_event(&self, event: ConnectionEvent);

    async fn send_outbound(&self, message: ChannelMessage) -> Result<(), PluginError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn channel_state_adjacency() {
        use ChannelState::*;
        let allowed = [
            (Unregistered, vec![Registered]),
            (Registered, vec![Connecting, Unregistered]),
            (Connecting, vec![Authenticating, Disconnected, Error]),
            (Authenticating, vec![Connected, Disconnected, Error]),
            (Connected, vec![Reconnecting, Disconnected, Error]),
            (Reconnecting, vec![Connected, Disconnected, Error]),
            (Disconnected, vec![Connecting, Unregistered]),
            (Error, vec![Unregistered]),
        ];
        for (from, targets) in allowed {
            for to in ChannelState::iter() {
                assert_eq!(
                    from.can_transition_to(to),
                    targets.contains(&to),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn auth_request_defaults_and_validation() {
        let req: AuthRequest = serde_json::from_str(r#"{"kind":"phone_otp"}"#).unwrap();
        assert_eq!(req, AuthRequest::phone_otp(None));

        let req: AuthRequest = serde_json::from_str(r#"{"kind":"token_entry","prompt":"API key"}"#).unwrap();
        assert_eq!(req, AuthRequest::token("API key"));

        assert!(
            AuthRequest::OAuth2 {
                authorization_url: "https://auth".into(),
                redirect_scheme: "".into(),
            }
            .validate()
            .is_err()
        );
        assert!(
            AuthRequest::QrCode {
                data_uri: "data:image/png;base64,AAAA".into(),
                expires_at: Some(1),
            }
            .validate()
            .is_ok()
        );
    }

    #[test]
    fn connection_event_exposes_id() {
        let ev = ConnectionEvent::Closed {
            connection_id: "c1".into(),
            code: 1000,
            reason: "Closed".into(),
        };
        assert_eq!(ev.connection_id(), "c1");
    }
}
