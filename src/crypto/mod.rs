//! Courier - Security layer
//!
//! - [`aead`]: XChaCha20-Poly1305 with packet nonce and AAD construction
//! - [`keys`]: zeroizing key type and OS randomness
//! - [`token`]: connect token encoding and verification
//! - [`context`]: per-session packet sealing with anti-replay

pub mod aead;
pub mod context;
pub mod keys;
pub mod token;

pub use aead::Direction;
pub use context::{CryptoContext, ReplayWindow};
pub use keys::{Key, random_array, random_buffer, random_key};
pub use token::{ConnectToken, PrivateToken, SealedToken, TokenInfo, unix_time_ms, verify_private};
