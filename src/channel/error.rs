use channel_plugin::{ChannelId, ChannelState, PluginError};
use thiserror::Error;

use crate::io::error::IoError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} is not connected")]
    NotConnected(ChannelId),

    #[error("channel {0} is already registered")]
    AlreadyRegistered(ChannelId),

    #[error("channel {0} is not registered")]
    NotFound(ChannelId),

    #[error("channel {channel_id} cannot move from {from} to {to}")]
    InvalidTransition {
        channel_id: ChannelId,
        from: ChannelState,
        to: ChannelState,
    },

    #[error("bridge serves {bridge} but metadata declares {metadata}")]
    ChannelMismatch { bridge: ChannelId, metadata: ChannelId },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error("extension error: {0}")]
    Extension(#[from] PluginError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_channel() {
        let id = ChannelId::new("acme.chat").unwrap();
        let err = ChannelError::InvalidTransition {
            channel_id: id.clone(),
            from: ChannelState::Registered,
            to: ChannelState::Connected,
        };
        assert_eq!(err.to_string(), "channel acme.chat cannot move from REGISTERED to CONNECTED");
        assert_eq!(ChannelError::NotConnected(id).to_string(), "channel acme.chat is not connected");

        let io: ChannelError = IoError::NotFound("connection x".into()).into();
        assert!(matches!(io, ChannelError::Io(IoError::NotFound(_))));
    }
}
