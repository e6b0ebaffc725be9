//! Cryptographically secure RNG wrapper.
//!
//! All randomness in the protocol (handshake nonces, session ids) is drawn
//! from the operating system RNG through this module.

use rand::{rngs::OsRng, CryptoRng, RngCore};

/// Return the cryptographically secure RNG used throughout the crate.
pub fn secure_rng() -> impl RngCore + CryptoRng {
    OsRng
}

/// Fill a fixed-size array with random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    secure_rng().fill_bytes(&mut out);
    out
}

/// Generate a random u64.
pub fn random_u64() -> u64 {
    secure_rng().next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_array_is_not_all_zero() {
        let buf: [u8; 32] = random_array();
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn random_u64_varies() {
        let v1 = random_u64();
        let v2 = random_u64();
        let v3 = random_u64();
        assert!(!(v1 == v2 && v2 == v3));
    }
}
