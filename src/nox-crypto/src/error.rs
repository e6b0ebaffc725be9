//! Error types for cryptographic operations.

use thiserror::Error;

/// Error type for all cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key material (wrong size, bad format)
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Encryption operation failed
    #[error("encryption failed")]
    Encrypt,

    /// Decryption failed: authentication tag mismatch. The frame must be
    /// treated as hostile and dropped; a single failure does not terminate
    /// the session.
    #[error("decryption failed: bad tag")]
    DecryptFail,

    /// HKDF expansion failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
