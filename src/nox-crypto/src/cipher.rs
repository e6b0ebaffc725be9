//! AEAD cipher state with deterministic nonces.
//!
//! Each direction of a session owns one [`CipherState`]. The 12-byte nonce
//! is `epoch:u32 BE || seq:u64 BE`; the epoch advances only on rekey, the
//! sequence on every sealed frame. A given `(epoch, seq)` pair is never
//! reused within a session.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{CryptoError, Result};
use crate::kdf::derive_session_keys;

/// AEAD key length in bytes.
pub const KEY_LEN: usize = 32;
/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Epoch value both sides start a session with.
pub const INITIAL_EPOCH: u32 = 1;

/// ChaCha20-Poly1305 state bound to one direction of one session.
pub struct CipherState {
    aead: ChaCha20Poly1305,
    epoch: u32,
    seq: u64,
}

impl CipherState {
    /// Construct from a 32-byte key and a starting epoch.
    pub fn new(key: &[u8], epoch: u32) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "aead key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            epoch,
            seq: 0,
        })
    }

    /// The sequence number the next [`seal`](Self::seal) will consume.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Current epoch.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    fn nonce(epoch: u32, seq: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&epoch.to_be_bytes());
        nonce[4..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    /// Seal `plaintext` under the next nonce and advance the sequence.
    pub fn seal(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(self.epoch, self.seq);
        let ct = self
            .aead
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        self.seq += 1;
        Ok(ct)
    }

    /// Open a ciphertext sealed under the peer's `seq`.
    ///
    /// The caller supplies the sequence carried alongside the ciphertext so
    /// out-of-order records within the replay window can still be opened.
    pub fn open(&self, seq: u64, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(self.epoch, seq);
        self.aead
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| CryptoError::DecryptFail)
    }
}

/// The transmit/receive cipher pair for one side of a session.
pub struct SessionCiphers {
    pub tx: CipherState,
    pub rx: CipherState,
}

impl SessionCiphers {
    /// Derive both directional states from the handshake material.
    pub fn derive(
        master: &[u8],
        session_id: &[u8; 8],
        client_nonce: &[u8; 16],
        server_nonce: &[u8; 16],
        is_server: bool,
    ) -> Result<Self> {
        let (tx_key, rx_key) =
            derive_session_keys(master, session_id, client_nonce, server_nonce, is_server)?;
        Ok(Self {
            tx: CipherState::new(tx_key.as_ref(), INITIAL_EPOCH)?,
            rx: CipherState::new(rx_key.as_ref(), INITIAL_EPOCH)?,
        })
    }
}
