//! Per-peer packet protection with anti-replay.
//!
//! A [`CryptoContext`] owns the two directional keys of one session, the
//! outbound packet sequence and the inbound replay window.

use crate::core::{AEAD_TAG_SIZE, CryptoError, PACKET_HEADER_SIZE, REPLAY_WINDOW_SIZE};

use super::{
    aead::{Direction, construct_aad, construct_nonce, decrypt, encrypt},
    keys::Key,
};

/// Anti-replay sliding window.
///
/// - Window size: [`REPLAY_WINDOW_SIZE`] packets
/// - Below window: rejected
/// - Seen sequence: rejected
/// - Above highest: window advances
#[derive(Clone)]
pub struct ReplayWindow {
    /// Bitmap of seen sequences; bit i is `highest - i`
    bitmap: [u64; REPLAY_WINDOW_SIZE / 64],
    /// Highest sequence seen so far
    highest: u64,
    /// Whether any packet was accepted yet
    initialized: bool,
}

impl ReplayWindow {
    /// Create a new replay window.
    pub fn new() -> Self {
        Self {
            bitmap: [0; REPLAY_WINDOW_SIZE / 64],
            highest: 0,
            initialized: false,
        }
    }

    /// Check if a sequence is a replay (without updating).
    pub fn is_replay(&self, sequence: u64) -> bool {
        if !self.initialized || sequence > self.highest {
            return false;
        }

        let diff = self.highest - sequence;
        if diff >= REPLAY_WINDOW_SIZE as u64 {
            return true;
        }
        self.bit(diff)
    }

    /// Check a sequence and record it.
    ///
    /// Must only be called after the packet authenticated, so that forged
    /// packets cannot advance the window.
    pub fn check_and_update(&mut self, sequence: u64) -> Result<(), CryptoError> {
        if !self.initialized {
            self.highest = sequence;
            self.initialized = true;
            self.set_bit(0);
            return Ok(());
        }

        if sequence > self.highest {
            self.shift_window(sequence - self.highest);
            self.highest = sequence;
            self.set_bit(0);
            return Ok(());
        }

        let diff = self.highest - sequence;
        if diff >= REPLAY_WINDOW_SIZE as u64 || self.bit(diff) {
            return Err(CryptoError::ReplayDetected);
        }
        self.set_bit(diff);
        Ok(())
    }

    fn bit(&self, diff: u64) -> bool {
        let index = diff as usize;
        (self.bitmap[index / 64] & (1 << (index % 64))) != 0
    }

    fn set_bit(&mut self, diff: u64) {
        let index = diff as usize;
        self.bitmap[index / 64] |= 1 << (index % 64);
    }

    /// Move every bit `shift` positions towards older sequences.
    fn shift_window(&mut self, shift: u64) {
        if shift >= REPLAY_WINDOW_SIZE as u64 {
            self.bitmap = [0; REPLAY_WINDOW_SIZE / 64];
            return;
        }

        let shift_words = (shift / 64) as usize;
        let shift_bits = (shift % 64) as u32;

        if shift_words > 0 {
            for i in (shift_words..self.bitmap.len()).rev() {
                self.bitmap[i] = self.bitmap[i - shift_words];
            }
            for word in self.bitmap.iter_mut().take(shift_words) {
                *word = 0;
            }
        }

        if shift_bits > 0 {
            let mut carry = 0u64;
            for word in self.bitmap.iter_mut() {
                let next_carry = *word >> (64 - shift_bits);
                *word = (*word << shift_bits) | carry;
                carry = next_carry;
            }
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys, sequence counter and replay window of one session.
pub struct CryptoContext {
    protocol_id: u64,
    /// Direction of packets we seal
    direction: Direction,
    send_key: Key,
    recv_key: Key,
    /// Sequence of the next packet we seal
    send_sequence: u64,
    replay_window: ReplayWindow,
}

impl CryptoContext {
    /// Context for the client side: seals with the c2s key.
    pub fn client(protocol_id: u64, client_to_server: Key, server_to_client: Key) -> Self {
        Self::new(protocol_id, Direction::ClientToServer, client_to_server, server_to_client)
    }

    /// Context for the server side: seals with the s2c key.
    pub fn server(protocol_id: u64, client_to_server: Key, server_to_client: Key) -> Self {
        Self::new(protocol_id, Direction::ServerToClient, server_to_client, client_to_server)
    }

    fn new(protocol_id: u64, direction: Direction, send_key: Key, recv_key: Key) -> Self {
        Self {
            protocol_id,
            direction,
            send_key,
            recv_key,
            send_sequence: 0,
            replay_window: ReplayWindow::new(),
        }
    }

    /// Start sealing at `sequence` instead of zero.
    pub fn with_send_sequence(mut self, sequence: u64) -> Self {
        self.send_sequence = sequence;
        self
    }

    /// Protocol ID bound into every packet.
    pub fn protocol_id(&self) -> u64 {
        self.protocol_id
    }

    /// Number of packets sealed so far.
    pub fn packets_sealed(&self) -> u64 {
        self.send_sequence
    }

    /// Seal a packet body, returning the complete datagram.
    pub fn seal(&mut self, packet_type: u8, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sequence = self.send_sequence;
        self.send_sequence = sequence
            .checked_add(1)
            .ok_or(CryptoError::CounterExhaustion)?;

        let nonce = construct_nonce(self.direction, sequence);
        let aad = construct_aad(packet_type, sequence, self.protocol_id);
        let ciphertext = encrypt(&self.send_key, &nonce, &aad, body)?;

        let mut datagram = Vec::with_capacity(PACKET_HEADER_SIZE + ciphertext.len());
        datagram.push(packet_type);
        datagram.extend_from_slice(&sequence.to_le_bytes());
        datagram.extend_from_slice(&ciphertext);
        Ok(datagram)
    }

    /// Open a sealed datagram, returning its type byte and body.
    ///
    /// The replay check runs before the AEAD; the window is only updated
    /// once the tag verified.
    pub fn open(&mut self, datagram: &[u8]) -> Result<(u8, Vec<u8>), CryptoError> {
        if datagram.len() < PACKET_HEADER_SIZE + AEAD_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let packet_type = datagram[0];
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&datagram[1..PACKET_HEADER_SIZE]);
        let sequence = u64::from_le_bytes(raw);

        if self.replay_window.is_replay(sequence) {
            return Err(CryptoError::ReplayDetected);
        }

        let nonce = construct_nonce(self.direction.opposite(), sequence);
        let aad = construct_aad(packet_type, sequence, self.protocol_id);
        let body = decrypt(&self.recv_key, &nonce, &aad, &datagram[PACKET_HEADER_SIZE..])?;

        self.replay_window.check_and_update(sequence)?;
        Ok((packet_type, body))
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("protocol_id", &self.protocol_id)
            .field("direction", &self.direction)
            .field("send_sequence", &self.send_sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KEY_BYTES;

    fn pair() -> (CryptoContext, CryptoContext) {
        let c2s = [0x01; KEY_BYTES];
        let s2c = [0x02; KEY_BYTES];
        let client = CryptoContext::client(7, Key::from_bytes(c2s), Key::from_bytes(s2c));
        let server = CryptoContext::server(7, Key::from_bytes(c2s), Key::from_bytes(s2c));
        (client, server)
    }

    #[test]
    fn test_replay_window_reordering() {
        let mut window = ReplayWindow::new();
        let arrivals = [
            (10, true),
            (10, false),
            (14, true),
            (12, true),
            (11, true),
            (13, true),
            (12, false),
            (14, false),
        ];
        for (sequence, fresh) in arrivals {
            assert_eq!(window.check_and_update(sequence).is_ok(), fresh, "sequence {sequence}");
        }
    }

    #[test]
    fn test_replay_window_jump() {
        let mut window = ReplayWindow::new();
        window.check_and_update(7).unwrap();
        window.check_and_update(500).unwrap();
        assert!(window.is_replay(7));
        assert!(!window.is_replay(499));
        assert!(!window.is_replay(501));

        window.check_and_update(499).unwrap();
        assert!(window.is_replay(499));
    }

    #[test]
    fn test_replay_window_too_old() {
        let mut window = ReplayWindow::new();
        let size = REPLAY_WINDOW_SIZE as u64;
        window.check_and_update(3 * size).unwrap();
        assert_eq!(window.check_and_update(2 * size), Err(CryptoError::ReplayDetected));
        assert!(window.check_and_update(2 * size + 1).is_ok());
    }

    #[test]
    fn test_context_both_directions() {
        let (mut client, mut server) = pair();

        let datagram = client.seal(4, b"ping").unwrap();
        assert_eq!(server.open(&datagram).unwrap(), (4, b"ping".to_vec()));

        let reply = server.seal(3, b"pong").unwrap();
        assert_eq!(client.open(&reply).unwrap(), (3, b"pong".to_vec()));
        assert_eq!(client.packets_sealed(), 1);
    }

    #[test]
    fn test_context_rejects_replay() {
        let (mut client, mut server) = pair();

        let datagram = client.seal(4, b"once").unwrap();
        assert!(server.open(&datagram).is_ok());
        assert_eq!(server.open(&datagram), Err(CryptoError::ReplayDetected));
    }

    #[test]
    fn test_context_rejects_reflection() {
        let (mut client, _) = pair();

        // A client must not accept its own packets bounced back
        let datagram = client.seal(4, b"echo").unwrap();
        assert_eq!(client.open(&datagram), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_context_rejects_type_rewrite() {
        let (mut client, mut server) = pair();

        let mut datagram = client.seal(4, b"data").unwrap();
        datagram[0] = 5;
        assert_eq!(server.open(&datagram), Err(CryptoError::DecryptionFailed));

        // Forged packet must not poison the window
        datagram[0] = 4;
        assert!(server.open(&datagram).is_ok());
    }

    #[test]
    fn test_context_protocol_bound() {
        let (mut client, _) = pair();
        let mut other = CryptoContext::server(
            8,
            Key::from_bytes([0x01; KEY_BYTES]),
            Key::from_bytes([0x02; KEY_BYTES]),
        );

        let datagram = client.seal(4, b"data").unwrap();
        assert_eq!(other.open(&datagram), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_context_send_sequence_offset() {
        let (_, mut server) = pair();
        let mut client = CryptoContext::client(
            7,
            Key::from_bytes([0x01; KEY_BYTES]),
            Key::from_bytes([0x02; KEY_BYTES]),
        );
        let mut late = CryptoContext::server(
            7,
            Key::from_bytes([0x01; KEY_BYTES]),
            Key::from_bytes([0x02; KEY_BYTES]),
        )
        .with_send_sequence(1 << 40);

        let early = server.seal(2, b"denied").unwrap();
        let shifted = late.seal(2, b"denied").unwrap();
        assert_eq!(shifted[1..9], (1u64 << 40).to_le_bytes());
        assert_ne!(early[9..], shifted[9..]);
        assert_eq!(client.open(&shifted).unwrap(), (2, b"denied".to_vec()));
    }
}
