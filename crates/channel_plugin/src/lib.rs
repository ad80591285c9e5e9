pub mod message;
pub mod plugin;
pub mod plugin_helpers;

#[cfg(feature = "test-utils")]
pub mod plugin_test_util;

pub use message::{
    ChannelAuthType, ChannelCapability, ChannelId, ChannelMessage, ChannelMetadata, MessageContent,
    MessageDirection, SessionId,
};
pub use plugin::{AuthRequest, ChannelExtension, ChannelState, ConnectionEvent, PluginError};
