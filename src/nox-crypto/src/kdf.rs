//! HKDF-SHA256 session key derivation.
//!
//! Both peers expand the pre-shared 32-byte master key into two directional
//! keys. The salt binds the keys to the session (`sessionID || clientNonce
//! || serverNonce`) and the info labels split the directions. The server
//! swaps the labels so that the client's transmit key is the server's
//! receive key and vice versa.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

/// Required master key length in bytes.
pub const MASTER_KEY_LEN: usize = 32;

const INFO_TX: &[u8] = b"noxv2-tx";
const INFO_RX: &[u8] = b"noxv2-rx";

/// A derived 32-byte session key, zeroized on drop.
pub type SessionKey = Zeroizing<[u8; 32]>;

/// Derive the (tx, rx) key pair for one side of a session.
///
/// `is_server` swaps the direction labels so the two sides agree on which
/// key protects which direction.
pub fn derive_session_keys(
    master: &[u8],
    session_id: &[u8; 8],
    client_nonce: &[u8; 16],
    server_nonce: &[u8; 16],
    is_server: bool,
) -> Result<(SessionKey, SessionKey)> {
    if master.len() != MASTER_KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "master key must be {MASTER_KEY_LEN} bytes, got {}",
            master.len()
        )));
    }

    let mut salt = [0u8; 8 + 16 + 16];
    salt[..8].copy_from_slice(session_id);
    salt[8..24].copy_from_slice(client_nonce);
    salt[24..].copy_from_slice(server_nonce);

    let (info_tx, info_rx) = if is_server {
        (INFO_RX, INFO_TX)
    } else {
        (INFO_TX, INFO_RX)
    };

    let hk = Hkdf::<Sha256>::new(Some(&salt), master);
    let mut tx = Zeroizing::new([0u8; 32]);
    let mut rx = Zeroizing::new([0u8; 32]);
    hk.expand(info_tx, tx.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(info_rx, rx.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((tx, rx))
}
