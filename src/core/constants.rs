//! Protocol constants for Courier.
//!
//! Wire sizes are fixed by the protocol and MUST NOT be changed. Timing
//! values are defaults; most of them can be overridden through
//! [`SocketConfig`](crate::socket::SocketConfig).

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Size of every symmetric key (private key, c2s and s2c keys).
pub const KEY_BYTES: usize = 32;

/// Size of the nonce that seals the private section of a connect token.
pub const CONNECT_TOKEN_NONCE_BYTES: usize = 24;

/// Size of the opaque user data carried by a connect token.
pub const USER_DATA_BYTES: usize = 256;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Nonce direction byte for client to server packets.
pub const NONCE_DIR_CLIENT: u8 = 0x00;

/// Nonce direction byte for server to client packets.
pub const NONCE_DIR_SERVER: u8 = 0x01;

/// Anti-replay window size in packets (bits).
pub const REPLAY_WINDOW_SIZE: usize = 2048;

// =============================================================================
// CONNECT TOKEN LAYOUT
// =============================================================================

/// Version string at the head of every token and connection request.
pub const VERSION_INFO: &[u8; VERSION_INFO_BYTES] = b"COURIER 1.00\0";

/// Length of [`VERSION_INFO`].
pub const VERSION_INFO_BYTES: usize = 13;

/// Total size of an encoded connect token.
pub const CONNECT_TOKEN_BYTES: usize = 2048;

/// Size of the encrypted private section (tag included).
pub const CONNECT_TOKEN_PRIVATE_BYTES: usize = 1024;

/// Maximum number of server addresses in one token.
pub const MAX_SERVER_ADDRESSES: usize = 32;

// =============================================================================
// PACKET LAYOUT
// =============================================================================

/// Header of an encrypted packet (type + sequence).
pub const PACKET_HEADER_SIZE: usize = 9;

/// Size of a connection request packet.
pub const CONNECTION_REQUEST_BYTES: usize = 1
    + VERSION_INFO_BYTES
    + 8
    + 8
    + CONNECT_TOKEN_NONCE_BYTES
    + CONNECT_TOKEN_PRIVATE_BYTES;

/// Largest datagram the engine ever emits.
pub const MAX_PACKET_BYTES: usize = 1200;

/// Largest payload slice carried by one parcel.
pub const MAX_PARCEL_PAYLOAD: usize = 960;

/// Maximum number of fragments per message.
pub const MAX_FRAGMENTS: usize = 256;

/// Largest message the delivery engine accepts.
pub const MAX_MESSAGE_BYTES: usize = MAX_PARCEL_PAYLOAD * MAX_FRAGMENTS;

/// Maximum acknowledgements piggybacked on a single packet.
pub const MAX_ACKS_PER_PACKET: usize = 16;

/// Maximum number of channels per socket (channel index is one byte).
pub const MAX_CHANNELS: usize = 255;

/// Copies of the disconnect packet sent when a session is torn down.
pub const DISCONNECT_REDUNDANCY: usize = 3;

// =============================================================================
// TIMING CONSTANTS
// =============================================================================

/// Period of the orchestrator tick.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Idle period after which a keep-alive is emitted.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Period between repeated connection requests while connecting.
pub const HANDSHAKE_RESEND_INTERVAL: Duration = Duration::from_millis(100);

/// Initial retransmission timeout before the first RTT sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(250);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(50);

/// Maximum retransmission timeout (backoff cap).
pub const MAX_RTO: Duration = Duration::from_secs(5);

/// Retransmissions of a single reliable parcel before the peer is faulted.
pub const MAX_RETRANSMITS: u32 = 16;

/// Idle lifetime of an incomplete reception.
pub const RECEPTION_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DELIVERY LIMITS
// =============================================================================

/// Maximum distance ahead of the next expected sequence on a reliable
/// channel. Beyond it the peer is faulted.
pub const RELIABLE_WINDOW: u64 = 1024;

/// Maximum live receptions per channel and mode.
pub const MAX_RECEPTIONS: usize = 64;

/// Replay history entries kept by a server. Unexpired entries are never
/// evicted; a full history refuses new tokens.
pub const MAX_TOKEN_HISTORY: usize = 4096;

/// First sequence used to seal denials. Sessions never count this high,
/// so a denial never shares a nonce with a session packet.
pub const DENIAL_SEQUENCE_BASE: u64 = 1 << 63;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_size() {
        assert_eq!(CONNECTION_REQUEST_BYTES, 1078);
        assert_eq!(VERSION_INFO.len(), VERSION_INFO_BYTES);
    }

    #[test]
    fn test_parcel_fits_packet() {
        // header + tag + data body header + full ack section
        let overhead = PACKET_HEADER_SIZE + AEAD_TAG_SIZE + 16 + 1 + MAX_ACKS_PER_PACKET * 11;
        assert!(MAX_PARCEL_PAYLOAD + overhead <= MAX_PACKET_BYTES);
    }
}
