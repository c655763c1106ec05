//! Error types for the core library.

use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Engine operation failed.
    #[error("engine error: {0}")]
    Engine(#[from] sealmail_engine::Error),

    /// Key derivation or symmetric cipher failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] sealmail_crypto::Error),

    /// Storage collaborator failed; propagated unchanged.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport collaborator failed; propagated unchanged.
    #[error("transport error: {0}")]
    Transport(String),

    /// No auth credentials cached for the user.
    #[error("no auth credentials found for: {0}")]
    NoCredentials(String),

    /// No user is logged in.
    #[error("user not yet logged in")]
    NoCurrentUser,

    /// Operation not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
