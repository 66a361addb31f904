//! Error types for Courier.

use thiserror::Error;

/// Reasons a connect token or connection attempt is rejected.
///
/// Authentication failures are final: they are never retried.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The authentication tag did not verify (wrong key or tampered bytes).
    #[error("token authentication tag did not verify")]
    BadTag,

    /// The token was issued for another protocol.
    #[error("protocol id mismatch: expected {expected:#x}, got {actual:#x}")]
    ProtocolMismatch {
        /// Protocol ID the verifier expects.
        expected: u64,
        /// Protocol ID carried by the token.
        actual: u64,
    },

    /// The token expired.
    #[error("token expired")]
    Expired,

    /// The token nonce was already used from another address.
    #[error("token nonce replayed")]
    Replayed,
}

/// Errors from connect token encoding and decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// A fixed-size field has the wrong length.
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Name of the offending field.
        field: &'static str,
        /// Required length (or maximum for variable fields).
        expected: usize,
        /// Length supplied.
        actual: usize,
    },

    /// Zero or too many server addresses.
    #[error("invalid address count: {0}")]
    InvalidAddresses(usize),

    /// `expire_timestamp` is not after `create_timestamp`.
    #[error("expire timestamp {expire} is not after create timestamp {create}")]
    InvalidTimestamps {
        /// Creation time (Unix ms).
        create: u64,
        /// Expiry time (Unix ms).
        expire: u64,
    },

    /// Structurally invalid token bytes.
    #[error("malformed token: {0}")]
    Malformed(&'static str),

    /// Authentication failure.
    #[error("authentication failure: {0}")]
    Auth(#[from] AuthFailure),
}

/// Errors from [`Message`](crate::buffer::Message) accessors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Read on a write-only message, or write on a read-only message.
    #[error("operation not allowed in the current message mode")]
    IllegalState,

    /// Read past the end of the payload.
    #[error("read of {requested} bytes with only {remaining} remaining")]
    OutOfRange {
        /// Bytes the read needed.
        requested: usize,
        /// Bytes left in the message.
        remaining: usize,
    },
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Replay detected.
    #[error("replay detected")]
    ReplayDetected,

    /// Packet sequence counter exhausted - session must terminate.
    #[error("sequence counter exhausted - session must terminate")]
    CounterExhaustion,
}

/// Errors raised by the per-channel delivery machinery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The channel index does not exist.
    #[error("invalid channel index {0}")]
    InvalidChannel(usize),

    /// The message needs more than the maximum number of fragments.
    #[error("message of {0} bytes exceeds the fragment limit")]
    MessageTooLarge(usize),

    /// The reliable send window is full.
    #[error("reliable send window is full on channel {0}")]
    WindowFull(usize),

    /// A reliable parcel arrived too far ahead of the next expected sequence.
    #[error("sequence {sequence} is beyond the window (next expected {expected})")]
    GapExceeded {
        /// Sequence carried by the parcel.
        sequence: u64,
        /// Next sequence the receiver expects.
        expected: u64,
    },

    /// Parcel metadata is inconsistent.
    #[error("malformed parcel: {0}")]
    MalformedParcel(&'static str),

    /// A reliable parcel was retransmitted too many times.
    #[error("retransmit limit reached on channel {channel} for sequence {sequence}")]
    RetransmitLimit {
        /// Channel index.
        channel: usize,
        /// Message sequence.
        sequence: u64,
    },
}

impl DeliveryError {
    /// Whether this error faults the peer it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeliveryError::GapExceeded { .. }
                | DeliveryError::MalformedParcel(_)
                | DeliveryError::RetransmitLimit { .. }
        )
    }
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one channel is required.
    #[error("at least one channel is required")]
    NoChannels,

    /// Channel index must fit in one byte.
    #[error("too many channels: {0}")]
    TooManyChannels(usize),

    /// An interval was zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    /// Reliable window out of bounds.
    #[error("invalid reliable window: {0}")]
    InvalidWindow(u64),
}
