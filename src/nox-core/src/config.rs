//! Key material and identifier parsing shared by both binaries.
//!
//! Configuration failures here are fatal at startup, before any session
//! exists.

use std::path::Path;

use anyhow::{bail, Context, Result};
use nox_crypto::MASTER_KEY_LEN;

use crate::ipam::SessionId;

/// Load the 32-byte pre-shared master key from an inline hex string or a
/// file containing the hex string. The inline form wins when both are set.
pub fn load_key(key_hex: Option<&str>, key_file: Option<&Path>) -> Result<[u8; MASTER_KEY_LEN]> {
    let hex_str = match (key_hex, key_file) {
        (Some(inline), _) => inline.trim().to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading key file {}", path.display()))?
            .trim()
            .to_string(),
        (None, None) => bail!("a pre-shared key is required (NOX_KEY_HEX or NOX_KEY_FILE)"),
    };
    let raw = hex::decode(&hex_str).context("key is not valid hex")?;
    if raw.len() != MASTER_KEY_LEN {
        bail!(
            "key must be {MASTER_KEY_LEN} bytes ({} hex chars), got {} bytes",
            MASTER_KEY_LEN * 2,
            raw.len()
        );
    }
    let mut key = [0u8; MASTER_KEY_LEN];
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Parse an 8-byte session id from 16 hex characters.
pub fn parse_session_id(s: &str) -> Result<SessionId> {
    let raw = hex::decode(s.trim()).context("session id is not valid hex")?;
    if raw.len() != 8 {
        bail!("session id must be 8 bytes (16 hex chars), got {} bytes", raw.len());
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&raw);
    Ok(id)
}

/// Fresh random session id.
pub fn random_session_id() -> SessionId {
    nox_crypto::rng::random_array()
}

/// Accept both `host:port` and the bare `:port` shorthand.
pub fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_key_roundtrip() {
        let key = load_key(Some(&"ab".repeat(32)), None).unwrap();
        assert_eq!(key, [0xAB; 32]);
    }

    #[test]
    fn key_file_is_trimmed() {
        let dir = std::env::temp_dir().join(format!("nox-key-{}", std::process::id()));
        std::fs::write(&dir, format!("{}\n", "00".repeat(32))).unwrap();
        let key = load_key(None, Some(&dir)).unwrap();
        std::fs::remove_file(&dir).ok();
        assert_eq!(key, [0u8; 32]);
    }

    #[test]
    fn wrong_key_length_rejected() {
        assert!(load_key(Some("abcd"), None).is_err());
        assert!(load_key(Some("zz"), None).is_err());
        assert!(load_key(None, None).is_err());
    }

    #[test]
    fn session_id_parsing() {
        assert_eq!(
            parse_session_id("0102030405060708").unwrap(),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert!(parse_session_id("0102").is_err());
        assert!(parse_session_id("not-hex-at-all!").is_err());
    }

    #[test]
    fn random_session_ids_differ() {
        assert_ne!(random_session_id(), random_session_id());
    }

    #[test]
    fn listen_addr_shorthand() {
        assert_eq!(normalize_listen_addr(":9000"), "0.0.0.0:9000");
        assert_eq!(normalize_listen_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
