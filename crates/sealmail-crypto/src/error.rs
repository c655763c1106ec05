//! Error types for the crypto library.

use thiserror::Error;

/// Errors that can occur during key derivation or symmetric encryption.
#[derive(Debug, Error)]
pub enum Error {
    /// Key is not the required length for the cipher.
    #[error("key must be {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key length in bytes.
        expected: usize,
        /// Length of the key actually supplied.
        actual: usize,
    },

    /// Key or salt is not valid hex.
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,

    /// Decryption failed: bad key, corrupt ciphertext, or authentication
    /// tag mismatch. Deliberately carries no detail about which.
    #[error("decryption failed")]
    Decrypt,

    /// Serializing the plaintext to its canonical text form failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The blocking worker task was cancelled or panicked.
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
