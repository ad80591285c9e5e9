use thiserror::Error;

use crate::io::handle::ConnectionState;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to send on connection {connection_id}: {source}")]
    Send {
        connection_id: String,
        #[source]
        source: BoxError,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("HTTP request cancelled (key '{0}')")]
    HttpCancelled(String),
}

impl IoError {
    pub fn connect(target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        IoError::Connect {
            target: target.into(),
            source: source.into(),
        }
    }

    pub fn send(connection_id: impl Into<String>, source: impl Into<BoxError>) -> Self {
        IoError::Send {
            connection_id: connection_id.into(),
            source: source.into(),
        }
    }

    pub fn http(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        IoError::Http {
            url: url.into(),
            source: source.into(),
        }
    }
}
