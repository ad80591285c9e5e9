use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::io::error::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Binary,
    Text,
}

/// One arrival of raw bytes on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoFrame {
    pub connection_id: String,
    pub payload: Vec<u8>,
    pub frame_type: FrameType,
    /// Epoch milliseconds.
    pub received_at: i64,
}

impl IoFrame {
    pub fn new(
        connection_id: impl Into<String>,
        payload: Vec<u8>,
        frame_type: FrameType,
        received_at: i64,
    ) -> Result<Self, IoError> {
        let connection_id = connection_id.into();
        if connection_id.trim().is_empty() {
            return Err(IoError::InvalidInput("frame connection id must not be blank".into()));
        }
        if received_at <= 0 {
            return Err(IoError::InvalidInput("frame receivedAt must be positive".into()));
        }
        Ok(Self {
            connection_id,
            payload,
            frame_type,
            received_at,
        })
    }

    /// Stamps the frame with the current time.
    pub fn now(connection_id: impl Into<String>, payload: Vec<u8>, frame_type: FrameType) -> Result<Self, IoError> {
        Self::new(connection_id, payload, frame_type, chrono::Utc::now().timestamp_millis())
    }

    pub fn payload_as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
