//! XChaCha20-Poly1305 AEAD encryption
//!
//! Every post-handshake packet and the private section of a connect token
//! are sealed with XChaCha20-Poly1305.
//!
//! Packet AAD layout:
//! ```text
//! [ packet_type (1) | sequence (8, LE64) | version_info (13) | protocol_id (8, LE64) ]
//! ```

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use super::keys::Key;
use crate::core::{
    AEAD_NONCE_SIZE, AEAD_TAG_SIZE, CryptoError, NONCE_DIR_CLIENT, NONCE_DIR_SERVER,
    PACKET_HEADER_SIZE, VERSION_INFO, VERSION_INFO_BYTES,
};

/// Size of AAD for encrypted packets.
pub const PACKET_AAD_SIZE: usize = PACKET_HEADER_SIZE + VERSION_INFO_BYTES + 8;

/// Direction of a packet, mixed into the nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client → Server (0x00)
    ClientToServer,
    /// Server → Client (0x01)
    ServerToClient,
}

impl Direction {
    /// Get the byte representation.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::ClientToServer => NONCE_DIR_CLIENT,
            Direction::ServerToClient => NONCE_DIR_SERVER,
        }
    }

    /// Get the opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// Construct a 24-byte packet nonce.
///
/// Layout:
/// ```text
/// [ direction (1) | zeros (15) | sequence (8) ]
/// ```
pub fn construct_nonce(direction: Direction, sequence: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0] = direction.as_byte();
    nonce[16..24].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// Construct the AAD for an encrypted packet.
pub fn construct_aad(packet_type: u8, sequence: u64, protocol_id: u64) -> [u8; PACKET_AAD_SIZE] {
    let mut aad = [0u8; PACKET_AAD_SIZE];

    aad[0] = packet_type;
    aad[1..9].copy_from_slice(&sequence.to_le_bytes());
    aad[9..9 + VERSION_INFO_BYTES].copy_from_slice(VERSION_INFO);
    aad[9 + VERSION_INFO_BYTES..].copy_from_slice(&protocol_id.to_le_bytes());

    aad
}

/// Encrypt plaintext using XChaCha20-Poly1305.
///
/// Returns the ciphertext with the 16-byte Poly1305 tag appended.
pub fn encrypt(
    key: &Key,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .encrypt(xnonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt ciphertext using XChaCha20-Poly1305.
///
/// Fails if the tag does not verify.
pub fn decrypt(
    key: &Key,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .decrypt(xnonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KEY_BYTES;

    #[test]
    fn test_nonce_layout() {
        let nonce = construct_nonce(Direction::ServerToClient, 42);

        assert_eq!(nonce[0], 0x01);
        assert_eq!(&nonce[1..16], &[0u8; 15]);
        assert_eq!(&nonce[16..24], &42u64.to_le_bytes());
    }

    #[test]
    fn test_aad_layout() {
        let aad = construct_aad(0x04, 7, 128);

        assert_eq!(aad[0], 0x04);
        assert_eq!(&aad[1..9], &7u64.to_le_bytes());
        assert_eq!(&aad[9..22], VERSION_INFO);
        assert_eq!(&aad[22..30], &128u64.to_le_bytes());
    }

    #[test]
    fn test_directions_never_share_nonce() {
        let c2s = construct_nonce(Direction::ClientToServer, 9);
        let s2c = construct_nonce(Direction::ClientToServer.opposite(), 9);
        assert_ne!(c2s, s2c);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = Key::from_bytes([0x42; KEY_BYTES]);
        let nonce = construct_nonce(Direction::ClientToServer, 1);
        let aad = construct_aad(0x03, 1, 5);

        let ciphertext = encrypt(&key, &nonce, &aad, b"courier").unwrap();
        assert_eq!(ciphertext.len(), 7 + AEAD_TAG_SIZE);

        let plaintext = decrypt(&key, &nonce, &aad, &ciphertext).unwrap();
        assert_eq!(plaintext, b"courier");
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let nonce = construct_nonce(Direction::ClientToServer, 1);
        let aad = construct_aad(0x03, 1, 5);
        let ciphertext = encrypt(&Key::from_bytes([1; KEY_BYTES]), &nonce, &aad, b"x").unwrap();

        let result = decrypt(&Key::from_bytes([2; KEY_BYTES]), &nonce, &aad, &ciphertext);
        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_decrypt_wrong_aad_fails() {
        let key = Key::from_bytes([0x42; KEY_BYTES]);
        let nonce = construct_nonce(Direction::ClientToServer, 1);
        let ciphertext = encrypt(&key, &nonce, &construct_aad(0x03, 1, 5), b"x").unwrap();

        let result = decrypt(&key, &nonce, &construct_aad(0x03, 1, 6), &ciphertext);
        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_decrypt_short_input() {
        let key = Key::from_bytes([0x42; KEY_BYTES]);
        let nonce = construct_nonce(Direction::ClientToServer, 1);
        assert_eq!(
            decrypt(&key, &nonce, &[], &[0u8; 4]),
            Err(CryptoError::DecryptionFailed)
        );
    }
}
