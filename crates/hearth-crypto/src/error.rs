//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during session cryptography.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key or signature field had the wrong length.
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Which field was malformed.
        field: &'static str,
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },

    /// A field was not valid base64.
    #[error("invalid base64 in {0}")]
    InvalidBase64(&'static str),

    /// The handshake body did not match the expected shape.
    #[error("invalid handshake format: {0}")]
    InvalidHandshake(String),

    /// The handshake signature did not verify.
    #[error("handshake signature verification failed")]
    SignatureVerification,

    /// Payload encryption failed.
    #[error("payload encryption failed")]
    Encryption,

    /// Payload decryption failed (wrong key, truncated or tampered data).
    #[error("payload decryption failed")]
    Decryption,

    /// The session channel has expired.
    #[error("session expired")]
    SessionExpired,

    /// Payload serialization failed.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
