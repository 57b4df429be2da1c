/// Error types for the chat sync core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected client-side, never reached the network
    #[error("Validation error: {0}")]
    Validation(String),

    /// Channel not connected; nothing is queued
    #[error("Channel disconnected: {0}")]
    Disconnected(String),

    #[error("No acknowledgment for message {local_key} within timeout")]
    AckTimeout { local_key: String },

    /// Link dropped after the send was emitted but before its ack
    #[error("Channel closed while message {local_key} awaited acknowledgment")]
    Interrupted { local_key: String },

    #[error("Message {local_key} rejected by server: {reason}")]
    Rejected { local_key: String, reason: String },

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Local key of the send this error belongs to, if any
    pub fn local_key(&self) -> Option<&str> {
        match self {
            SyncError::AckTimeout { local_key }
            | SyncError::Interrupted { local_key }
            | SyncError::Rejected { local_key, .. } => Some(local_key),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
