//! Error types for the engine library.

use thiserror::Error;

/// Errors that can occur while driving the worker-hosted engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Requested key strength is not in the allow-list. Rejected before
    /// anything is sent to the worker.
    #[error("key strength {0} not allowed (must be one of 2048, 4096)")]
    InvalidKeyStrength(u32),

    /// The worker channel is gone (task ended or send failed).
    #[error("worker channel closed: {0}")]
    Channel(String),

    /// The worker sent a reply we could not make sense of.
    #[error("malformed worker reply: {0}")]
    MalformedReply(String),

    /// The worker reported a request-level failure (e.g. missing file).
    #[error("worker request failed: {0}")]
    Request(String),

    /// An engine command exited with a non-zero status. Carries the
    /// accumulated stdout for diagnostics.
    #[error("engine command failed with exit status {status}")]
    Command {
        /// Exit status reported by the engine.
        status: i32,
        /// Everything the engine wrote before exiting.
        stdout: Vec<String>,
    },

    /// Serializing or deserializing a protocol message failed.
    #[error("protocol serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
