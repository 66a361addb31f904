//! An authenticated remote party.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::core::{MAX_ACKS_PER_PACKET, SessionId};
use crate::crypto::CryptoContext;
use crate::delivery::{Delivered, Dispatcher};
use crate::transport::{Heartbeat, Packet, PacketError, TransportError};

/// Which side of the connection this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// We accepted the peer.
    Server,
    /// We connected to the peer.
    Client,
}

/// What an inbound packet asks of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Nothing beyond the delivered messages.
    Continue,
    /// The remote side closed the session.
    Disconnect,
}

/// Session state for one remote party.
pub struct Peer {
    /// Session identifier.
    pub session_id: SessionId,
    /// Client ID from the token.
    pub client_id: u64,
    /// Remote address.
    pub address: SocketAddr,
    /// Local endpoint the peer talks to.
    pub endpoint: usize,
    /// Idle timeout, `None` when disabled.
    pub timeout: Option<Duration>,
    /// Application slot.
    pub data: Option<Box<dyn Any + Send>>,
    side: Side,
    crypto: CryptoContext,
    heartbeat: Heartbeat,
    dispatcher: Dispatcher,
}

impl Peer {
    /// Create a peer from an established crypto context.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        client_id: u64,
        address: SocketAddr,
        endpoint: usize,
        side: Side,
        crypto: CryptoContext,
        dispatcher: Dispatcher,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Self {
        Self {
            session_id,
            client_id,
            address,
            endpoint,
            timeout,
            data: None,
            side,
            crypto,
            heartbeat: Heartbeat::new(now),
            dispatcher,
        }
    }

    /// Which side we are on.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Liveness and RTT state.
    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Mutable liveness and RTT state.
    pub fn heartbeat_mut(&mut self) -> &mut Heartbeat {
        &mut self.heartbeat
    }

    /// Channel pipes.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Mutable channel pipes.
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Seal `packet` for this peer.
    pub fn seal(&mut self, packet: &Packet, now: Instant) -> Result<Vec<u8>, PacketError> {
        let datagram = packet.seal(&mut self.crypto)?;
        self.heartbeat.on_sent(now);
        Ok(datagram)
    }

    /// Authenticate and decode a datagram from this peer.
    pub fn open(&mut self, datagram: &[u8]) -> Result<Packet, PacketError> {
        Packet::open(&mut self.crypto, datagram)
    }

    /// Seal every queued parcel into a data packet, piggybacking acks.
    pub fn flush(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) -> Result<(), PacketError> {
        while let Some(parcel) = self.dispatcher.next_parcel() {
            let acks = self.dispatcher.take_acks(MAX_ACKS_PER_PACKET);
            out.push(self.seal(&Packet::Data { parcel, acks }, now)?);
        }
        Ok(())
    }

    /// Seal a keep-alive carrying `local_time` and pending acks.
    pub fn keep_alive(&mut self, now: Instant, local_time: u64) -> Result<Vec<u8>, PacketError> {
        let acks = self.dispatcher.take_acks(MAX_ACKS_PER_PACKET);
        let keep_alive = self.heartbeat.keep_alive(now, local_time, acks);
        self.seal(&Packet::KeepAlive(keep_alive), now)
    }

    /// Whether a keep-alive is owed on this tick.
    pub fn wants_keep_alive(&self, now: Instant, interval: Duration) -> bool {
        self.dispatcher.has_pending_acks() || self.heartbeat.needs_keep_alive(now, interval)
    }

    /// Apply an authenticated packet, appending completed messages to `out`.
    pub fn receive(
        &mut self,
        packet: Packet,
        now: Instant,
        local_time: u64,
        out: &mut Vec<Delivered>,
    ) -> Result<Inbound, TransportError> {
        self.heartbeat.on_received(now);

        match packet {
            Packet::KeepAlive(keep_alive) => {
                self.heartbeat.on_keep_alive(now, local_time, &keep_alive);
                if let Some(sample) = self.dispatcher.on_acks(&keep_alive.acks, now) {
                    self.heartbeat.record_sample(sample);
                }
                if self.side == Side::Client {
                    self.heartbeat.observe_peer_clock(keep_alive.ping_time, local_time);
                }
            }
            Packet::Data { parcel, acks } => {
                if let Some(sample) = self.dispatcher.on_acks(&acks, now) {
                    self.heartbeat.record_sample(sample);
                }
                self.dispatcher.on_parcel(parcel, now, out)?;
            }
            Packet::Disconnect => return Ok(Inbound::Disconnect),
            // Repeated acceptances after a lost reply.
            Packet::Accepted(_) | Packet::Denied(_) => {}
        }
        Ok(Inbound::Continue)
    }

    /// Queue due retransmissions.
    pub fn poll_retransmits(&mut self, now: Instant) -> Result<(), TransportError> {
        let rto = self.heartbeat.rto();
        self.dispatcher.poll_retransmits(now, rto)?;
        Ok(())
    }

    /// Whether nothing arrived within the idle timeout.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| self.heartbeat.is_timed_out(now, timeout))
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("session_id", &self.session_id)
            .field("client_id", &self.client_id)
            .field("address", &self.address)
            .field("endpoint", &self.endpoint)
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}
