//! Connection handshake state.
//!
//! The handshake is a single round trip: the client repeats its connection
//! request until the server answers with an encrypted acceptance or denial.
//!
//! ```text
//! AwaitingToken --send--> TokenVerifying --Accepted--> Accepted
//!                                        --Denied----> Denied
//!                                        --timeout---> TimedOut
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::core::{CONNECT_TOKEN_NONCE_BYTES, ConnectResult, SessionId};
use crate::crypto::{CryptoContext, Key, SealedToken, TokenInfo};
use crate::transport::{Accepted, ConnectionRequest, Packet, TransportError};

/// Client handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    AwaitingToken,
    /// Requests are in flight.
    TokenVerifying,
    /// A server accepted.
    Accepted,
    /// A server denied.
    Denied,
    /// No answer within the token timeout.
    TimedOut,
}

impl HandshakeState {
    /// Whether the handshake finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Denied | Self::TimedOut)
    }

    /// Outcome reported to the application, once terminal.
    pub fn result(self) -> Option<ConnectResult> {
        match self {
            Self::Accepted => Some(ConnectResult::Success),
            Self::Denied => Some(ConnectResult::Denied),
            Self::TimedOut => Some(ConnectResult::TimedOut),
            Self::AwaitingToken | Self::TokenVerifying => None,
        }
    }
}

/// Convert a token timeout in seconds; negative disables.
pub fn token_timeout(seconds: i32) -> Option<Duration> {
    u64::try_from(seconds).ok().map(Duration::from_secs)
}

/// Client side of the handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    state: HandshakeState,
    request: Vec<u8>,
    addresses: Vec<SocketAddr>,
    crypto: CryptoContext,
    timeout: Option<Duration>,
    started: Instant,
    last_sent: Option<Instant>,
}

impl ClientHandshake {
    /// Prepare a handshake from the public section of a token.
    pub fn new(info: &TokenInfo, now: Instant) -> Self {
        let request = ConnectionRequest {
            token: SealedToken::from(info),
        };
        Self {
            state: HandshakeState::AwaitingToken,
            request: request.encode(),
            addresses: info.addresses.clone(),
            crypto: CryptoContext::client(
                info.protocol_id,
                Key::from_bytes(info.client_to_server_key),
                Key::from_bytes(info.server_to_client_key),
            ),
            timeout: token_timeout(info.timeout),
            started: now,
            last_sent: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Encoded connection request.
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    /// Server addresses from the token.
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// Idle timeout carried by the token.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Advance timers. Returns true when the request should be sent to
    /// every address.
    pub fn poll(&mut self, now: Instant, resend_interval: Duration) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self
            .timeout
            .is_some_and(|timeout| now.saturating_duration_since(self.started) >= timeout)
        {
            self.state = HandshakeState::TimedOut;
            return false;
        }

        let due = self
            .last_sent
            .is_none_or(|sent| now.saturating_duration_since(sent) >= resend_interval);
        if due {
            self.last_sent = Some(now);
            self.state = HandshakeState::TokenVerifying;
        }
        due
    }

    /// Handle a datagram from `from`.
    ///
    /// Returns the acceptance when this datagram completed the handshake.
    pub fn on_datagram(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
    ) -> Result<Option<Accepted>, TransportError> {
        if self.state.is_terminal() || !self.addresses.contains(&from) {
            return Err(TransportError::UnknownSession);
        }

        match Packet::open(&mut self.crypto, datagram)? {
            Packet::Accepted(accepted) => {
                self.state = HandshakeState::Accepted;
                Ok(Some(accepted))
            }
            Packet::Denied(_) => {
                self.state = HandshakeState::Denied;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Hand the session keys over to the new peer.
    pub fn into_crypto(self) -> CryptoContext {
        self.crypto
    }
}

/// A server-side acceptance awaiting the client's first authenticated
/// packet. While it lives, a repeated request re-sends the acceptance.
#[derive(Debug, Clone, Copy)]
pub struct ServerHandshake {
    /// Session created for the request.
    pub session_id: SessionId,
    /// When the record lapses, `None` for tokens without timeout.
    pub expires_at: Option<Instant>,
}

impl ServerHandshake {
    /// Create a record for `session_id`.
    pub fn new(session_id: SessionId, now: Instant, timeout: Option<Duration>) -> Self {
        Self {
            session_id,
            expires_at: timeout.map(|timeout| now + timeout),
        }
    }

    /// Whether the record lapsed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Result of looking a nonce up in the [`TokenHistory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenUse {
    /// Never seen.
    Fresh,
    /// Seen from the same address: a repeated request.
    Repeated,
    /// Seen from another address: a replay.
    Replayed,
}

/// Connect token nonces already consumed.
///
/// A nonce stays remembered until its token expires. When every slot holds
/// an unexpired token the history refuses new nonces instead of forgetting
/// live ones.
#[derive(Debug)]
pub struct TokenHistory {
    entries: HashMap<[u8; CONNECT_TOKEN_NONCE_BYTES], (SocketAddr, u64)>,
    capacity: usize,
}

impl TokenHistory {
    /// Create a history holding at most `capacity` nonces.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Classify a nonce presented from `from`.
    pub fn check(&self, nonce: &[u8; CONNECT_TOKEN_NONCE_BYTES], from: SocketAddr) -> TokenUse {
        match self.entries.get(nonce) {
            None => TokenUse::Fresh,
            Some((address, _)) if *address == from => TokenUse::Repeated,
            Some(_) => TokenUse::Replayed,
        }
    }

    /// Record a consumed nonce. Returns false, recording nothing, when the
    /// history is full of tokens still valid at `now_ms`.
    pub fn insert(
        &mut self,
        nonce: [u8; CONNECT_TOKEN_NONCE_BYTES],
        from: SocketAddr,
        expire_timestamp: u64,
        now_ms: u64,
    ) -> bool {
        if !self.entries.contains_key(&nonce) && self.entries.len() >= self.capacity {
            self.prune(now_ms);
            if self.entries.len() >= self.capacity {
                return false;
            }
        }
        self.entries.insert(nonce, (from, expire_timestamp));
        true
    }

    /// Forget nonces of tokens that expired before `now_ms`.
    pub fn prune(&mut self, now_ms: u64) {
        self.entries.retain(|_, (_, expire)| *expire >= now_ms);
    }

    /// Remembered nonces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no nonce is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
