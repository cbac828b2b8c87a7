//! Error types for calls into remote collaborators

use thiserror::Error;

/// Failure of a single call against a remote service (orchestration, identity, workflow)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The addressed entity does not exist (HTTP 404 or equivalent)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The service answered and refused the request
    #[error("Rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The service could not be reached or the connection broke mid-call
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service answered with a payload we could not interpret
    #[error("Decode error: {0}")]
    Decode(String),

    /// Credentials were missing, expired or refused
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ServiceError {
    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a rejection
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Check whether the error means the entity is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
