/// Error types for the chat delivery layer
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
