//! Symmetric key handling and random generation.

use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroize;

use crate::core::{KEY_BYTES, TokenError};

/// A 32-byte symmetric key.
///
/// Used for the server private key and for the two directional session
/// keys. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    bytes: [u8; KEY_BYTES],
}

impl Key {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self { bytes }
    }

    /// Create a key from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TokenError> {
        let bytes: [u8; KEY_BYTES] = bytes.try_into().map_err(|_| TokenError::InvalidLength {
            field: "key",
            expected: KEY_BYTES,
            actual: bytes.len(),
        })?;
        Ok(Self { bytes })
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self { bytes: random_key() }
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.bytes
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key([REDACTED])")
    }
}

/// Produce `len` cryptographically strong random bytes.
pub fn random_buffer(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Produce a random key-sized array.
pub fn random_key() -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    key
}

/// Produce a random fixed-size array (nonces, test material).
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CONNECT_TOKEN_NONCE_BYTES;

    #[test]
    fn test_random_buffer_length() {
        assert_eq!(random_buffer(0).len(), 0);
        assert_eq!(random_buffer(77).len(), 77);
    }

    #[test]
    fn test_random_buffers_differ() {
        // 2^-256 chance of a false failure
        assert_ne!(random_buffer(32), random_buffer(32));
        assert_ne!(random_array::<CONNECT_TOKEN_NONCE_BYTES>(), random_array());
    }

    #[test]
    fn test_key_from_slice_length() {
        assert!(Key::from_slice(&[7u8; KEY_BYTES]).is_ok());
        let err = Key::from_slice(&[7u8; 31]).unwrap_err();
        assert_eq!(
            err,
            TokenError::InvalidLength {
                field: "key",
                expected: KEY_BYTES,
                actual: 31
            }
        );
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = Key::from_bytes([0x42; KEY_BYTES]);
        assert_eq!(format!("{key:?}"), "Key([REDACTED])");
    }
}
