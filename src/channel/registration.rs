use channel_plugin::{ChannelId, ChannelMetadata, ChannelState};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::channel::error::ChannelError;

pub const UNSPECIFIED_ERROR: &str = "unspecified error";

/// Normalizes the error text that accompanies a move into `state`.
pub(crate) fn error_message_for(
    state: ChannelState,
    error_message: Option<String>,
) -> Result<Option<String>, ChannelError> {
    match (state, error_message) {
        (ChannelState::Error, Some(msg)) if !msg.trim().is_empty() => Ok(Some(msg)),
        (ChannelState::Error, _) => Ok(Some(UNSPECIFIED_ERROR.to_string())),
        (_, Some(msg)) if !msg.trim().is_empty() => Err(ChannelError::InvalidInput(format!(
            "error message given for non-error state {state}: {msg}"
        ))),
        (_, _) => Ok(None),
    }
}

/// What the registry knows about one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelRegistration {
    pub metadata: ChannelMetadata,
    pub state: ChannelState,
    pub registered_at: DateTime<Utc>,
    pub last_state_change_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ChannelRegistration {
    pub fn new(metadata: ChannelMetadata, at: DateTime<Utc>) -> Self {
        Self {
            metadata,
            state: ChannelState::Registered,
            registered_at: at,
            last_state_change_at: at,
            error_message: None,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.metadata.channel_id
    }

    /// Validated copy in `next`. An error message belongs to `ERROR` only.
    pub fn with_state(
        &self,
        next: ChannelState,
        at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<Self, ChannelError> {
        if !self.state.can_transition_to(next) {
            return Err(ChannelError::InvalidTransition {
                channel_id: self.channel_id().clone(),
                from: self.state,
                to: next,
            });
        }
        let error_message = error_message_for(next, error_message)?;
        Ok(Self {
            state: next,
            last_state_change_at: at,
            error_message,
            ..self.clone()
        })
    }
}
