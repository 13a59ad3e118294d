//! Error types for trickle-chat

use thiserror::Error;

/// Result type alias using trickle-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while streaming or storing conversations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer (open, transport, client request)
    #[error(transparent)]
    Wire(#[from] trickle_wire::Error),

    /// No conversation with this id
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// The ledger refused or could not perform a write
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Ledger file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ledger entry (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP status behind this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Wire(e) => e.status(),
            _ => None,
        }
    }

    /// Whether the endpoint rejected the request before streaming
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Wire(e) if e.is_client_error())
    }

    /// Check if a caller-driven retry could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Wire(e) if e.is_retryable())
    }
}
