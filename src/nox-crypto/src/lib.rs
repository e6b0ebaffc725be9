//! # NOX Crypto
//!
//! Cryptographic primitives for the NOX tunnel:
//!
//! - [`CipherState`]: ChaCha20-Poly1305 AEAD with a deterministic
//!   `epoch || seq` nonce and a monotonically increasing sequence counter
//! - [`derive_session_keys`]: HKDF-SHA256 derivation of per-direction
//!   session keys from the pre-shared master key and handshake nonces
//! - [`rng`]: cryptographically secure randomness wrapper
//!
//! The two directions of a session never share a `CipherState`; each side
//! holds one for transmit and one for receive, with the key roles swapped
//! between client and server so that client-tx always equals server-rx.

/// AEAD cipher state with deterministic nonces
pub mod cipher;
/// Error types for cryptographic operations
pub mod error;
/// HKDF session key derivation
pub mod kdf;
/// Cryptographically secure RNG wrapper
pub mod rng;

pub use cipher::{CipherState, SessionCiphers, INITIAL_EPOCH, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use error::{CryptoError, Result};
pub use kdf::{derive_session_keys, SessionKey, MASTER_KEY_LEN};
