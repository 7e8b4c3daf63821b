use thiserror::Error;

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur while running the hub or a session
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),


    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Hub is no longer running")]
    HubClosed,

    #[error("Session {0} is already registered")]
    DuplicateSession(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for HubError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        HubError::HubClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for HubError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        HubError::HubClosed
    }
}
