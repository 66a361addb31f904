//! Transport layer error types.
//!
//! Anything that fails before a packet authenticates is dropped without a
//! reply, so that probing never confirms a session exists.

use std::io;

use thiserror::Error;

use super::packet::PacketError;
use crate::core::{CryptoError, DeliveryError, TokenError};

/// Errors raised while handling one datagram.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed or unauthenticated packet.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Connection request token rejected.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Delivery state rejected a decrypted parcel.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Datagram from an address with no peer or handshake.
    #[error("unknown session")]
    UnknownSession,

    /// Token does not list any address this server is bound to.
    #[error("server address not listed in token")]
    AddressNotListed,
}

impl TransportError {
    /// Check if this error should result in silent drop (no response sent).
    pub fn is_silent_drop(&self) -> bool {
        match self {
            TransportError::Packet(PacketError::Crypto(_)) => true,
            TransportError::Packet(PacketError::Empty | PacketError::InvalidType(_)) => true,
            TransportError::Packet(PacketError::InvalidLength { .. }) => true,
            TransportError::Packet(PacketError::UnsupportedVersion) => true,
            TransportError::Token(_) => true,
            TransportError::UnknownSession | TransportError::AddressNotListed => true,
            _ => false,
        }
    }

    /// Check if this error is fatal to the peer that sent the packet.
    ///
    /// Only raised after the packet authenticated: a well-keyed peer sent
    /// something no conforming implementation produces.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Packet(PacketError::Crypto(CryptoError::CounterExhaustion)) => true,
            TransportError::Packet(err) => !matches!(
                err,
                PacketError::Crypto(_)
                    | PacketError::Empty
                    | PacketError::InvalidType(_)
                    | PacketError::InvalidLength { .. }
                    | PacketError::UnsupportedVersion
            ),
            TransportError::Delivery(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Check if this error is a security-related error.
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            TransportError::Packet(PacketError::Crypto(_))
                | TransportError::Token(TokenError::Auth(_))
                | TransportError::AddressNotListed
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AuthFailure;

    #[test]
    fn test_pre_auth_errors_are_silent() {
        let errors = [
            TransportError::Packet(PacketError::Crypto(CryptoError::DecryptionFailed)),
            TransportError::Packet(PacketError::Crypto(CryptoError::ReplayDetected)),
            TransportError::Packet(PacketError::InvalidType(0x7f)),
            TransportError::Token(TokenError::Auth(AuthFailure::Expired)),
            TransportError::UnknownSession,
        ];
        for err in errors {
            assert!(err.is_silent_drop(), "{err}");
            assert!(!err.is_fatal(), "{err}");
        }
    }

    #[test]
    fn test_post_auth_violations_are_fatal() {
        let errors = [
            TransportError::Packet(PacketError::TrailingBytes(3)),
            TransportError::Packet(PacketError::InvalidMode(9)),
            TransportError::Delivery(DeliveryError::GapExceeded {
                sequence: 5000,
                expected: 1,
            }),
        ];
        for err in errors {
            assert!(err.is_fatal(), "{err}");
            assert!(!err.is_silent_drop(), "{err}");
        }
    }

    #[test]
    fn test_security_classification() {
        assert!(TransportError::Token(TokenError::Auth(AuthFailure::BadTag)).is_security_error());
        assert!(TransportError::AddressNotListed.is_security_error());
        assert!(!TransportError::UnknownSession.is_security_error());
    }
}
