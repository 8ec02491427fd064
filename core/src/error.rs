/// Error types for the chat core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(u64),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl ChatError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Io(_)
                | ChatError::Connection(_)
                | ChatError::Timeout(_)
                | ChatError::NotConnected
                | ChatError::Storage(_)
                | ChatError::SendFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
