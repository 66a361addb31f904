//! Small value types shared across layers.

use std::fmt;

/// Identifier of a session, assigned by the server in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a session ID from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Delivery guarantee of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelMode {
    /// Fire and forget; duplicates and reordering pass through.
    Unreliable,
    /// Only messages newer than the last delivered one are surfaced.
    Sequenced,
    /// Every message exactly once, in send order.
    #[default]
    Reliable,
}

impl ChannelMode {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ChannelMode::Unreliable),
            1 => Some(ChannelMode::Sequenced),
            2 => Some(ChannelMode::Reliable),
            _ => None,
        }
    }

    /// Wire byte.
    pub fn as_byte(self) -> u8 {
        match self {
            ChannelMode::Unreliable => 0,
            ChannelMode::Sequenced => 1,
            ChannelMode::Reliable => 2,
        }
    }

    /// Slot index used for per-mode state.
    pub(crate) fn index(self) -> usize {
        self.as_byte() as usize
    }
}

/// Outcome of a client connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    /// A server accepted the token.
    Success,
    /// A server explicitly denied the token.
    Denied,
    /// No server answered within the token timeout.
    TimedOut,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called locally.
    Requested,
    /// The remote side sent a disconnect packet.
    Remote,
    /// Nothing was received within the timeout.
    Timeout,
    /// The peer sent a malformed packet or exceeded the reliable window.
    ProtocolViolation,
    /// A reliable parcel exhausted its retransmissions.
    RetransmitLimit,
    /// The socket was stopped.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mode_bytes() {
        for mode in [ChannelMode::Unreliable, ChannelMode::Sequenced, ChannelMode::Reliable] {
            assert_eq!(ChannelMode::from_byte(mode.as_byte()), Some(mode));
        }
        assert_eq!(ChannelMode::from_byte(3), None);
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId::new(0x2a).to_string(), "000000000000002a");
    }
}
