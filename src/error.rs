//! Error types for the whitebox controller

use thiserror::Error;

use crate::handler::HandlerError;

/// Main error type for framework operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Structural or semantic problem in the loaded configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Handler transport failure (timeout, non-zero exit, non-200, ...)
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// The handler returned a snapshot that fails validation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// JSON encoding or decoding failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Injection token could not be verified
    #[error("token error: {0}")]
    Token(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-state error with the given message
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a token error with the given message
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }
}
