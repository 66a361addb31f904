//! Sans-IO socket engine.
//!
//! The engine owns every peer, handshake and delivery structure of a socket
//! but performs no I/O: datagrams go in through [`Engine::handle_datagram`],
//! timers advance through [`Engine::update`], and the results come out as
//! [`Transmit`]s and [`Event`]s. The tokio driver in
//! [`Socket`](super::Socket) is one user; the tests wire two engines
//! together directly.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::config::SocketConfig;
use super::stats::{
    ApiStatistics, BufferStatistics, DeliveryStatistics, ProtocolStatistics, Statistics, Traffic,
};
use crate::buffer::{Message, MessagePool, pool::DEFAULT_POOL_SIZE};
use crate::core::{
    ConnectResult, DENIAL_SEQUENCE_BASE, DISCONNECT_REDUNDANCY, DisconnectReason,
    MAX_TOKEN_HISTORY, SessionId, TokenError,
};
use crate::crypto::{
    CryptoContext, Key, PrivateToken, TokenInfo, unix_time_ms, verify_private,
};
use crate::delivery::{Delivered, Dispatcher};
use crate::protocol::{
    ClientHandshake, Inbound, Peer, ServerHandshake, Side, TokenHistory, TokenUse, token_timeout,
};
use crate::session::Session;
use crate::transport::{
    Accepted, ConnectionRequest, DenyReason, Packet, PacketType, Rtt, TransportError,
    TransportResult, peek_type,
};

/// A datagram to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Index of the local endpoint to send from.
    pub endpoint: usize,
    /// Destination.
    pub to: SocketAddr,
    /// Datagram bytes.
    pub bytes: Vec<u8>,
}

/// Something the application should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A session was established.
    Connected(SessionId),
    /// A session ended.
    Disconnected(SessionId, DisconnectReason),
    /// A message arrived.
    Received {
        /// Sending session.
        session: SessionId,
        /// Channel index.
        channel: u8,
        /// Message bytes.
        payload: Bytes,
    },
    /// The client handshake finished.
    ConnectResult(ConnectResult),
}

struct ServerRole {
    key: Key,
    protocol_id: u64,
    max_clients: usize,
}

enum Role {
    Idle,
    Server(ServerRole),
    Client,
}

/// What remains of a session between its teardown and the dispatch of its
/// `Disconnected` event.
pub(crate) struct Departed {
    pub client_id: u64,
    pub address: SocketAddr,
    pub data: Option<Box<dyn Any + Send>>,
    pub rtt: Rtt,
}

/// Socket state without I/O.
pub struct Engine {
    config: SocketConfig,
    role: Role,
    endpoints: Vec<SocketAddr>,
    start: Instant,
    now: Instant,
    peers: HashMap<SessionId, Peer>,
    addresses: HashMap<SocketAddr, SessionId>,
    departed: HashMap<SessionId, Departed>,
    acceptances: HashMap<SocketAddr, ServerHandshake>,
    handshake: Option<ClientHandshake>,
    history: TokenHistory,
    /// Denials sealed so far; offsets each denial's sequence.
    denials: u64,
    next_session_id: u64,
    transmits: VecDeque<Transmit>,
    events: VecDeque<Event>,
    pool: MessagePool,
    traffic: Traffic,
}

impl Engine {
    /// Create an idle engine. `now` is the origin of [`Engine::time`].
    pub fn new(config: SocketConfig, now: Instant) -> Self {
        Self {
            config,
            role: Role::Idle,
            endpoints: Vec::new(),
            start: now,
            now,
            peers: HashMap::new(),
            addresses: HashMap::new(),
            departed: HashMap::new(),
            acceptances: HashMap::new(),
            handshake: None,
            history: TokenHistory::new(MAX_TOKEN_HISTORY),
            denials: 0,
            next_session_id: 1,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            pool: MessagePool::new(DEFAULT_POOL_SIZE),
            traffic: Traffic::default(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Start accepting connection requests on `endpoints`.
    pub fn listen(
        &mut self,
        private_key: &[u8],
        protocol_id: u64,
        max_clients: usize,
        endpoints: Vec<SocketAddr>,
        now: Instant,
    ) -> Result<(), TokenError> {
        let key = Key::from_slice(private_key)?;
        self.now = now;
        self.role = Role::Server(ServerRole {
            key,
            protocol_id,
            max_clients,
        });
        info!(?endpoints, protocol_id, max_clients, "listening");
        self.endpoints = endpoints;
        Ok(())
    }

    /// Start a client handshake from `endpoints` using a parsed token.
    pub fn connect(&mut self, token: &TokenInfo, endpoints: Vec<SocketAddr>, now: Instant) {
        self.now = now;
        self.role = Role::Client;
        self.endpoints = endpoints;
        self.handshake = Some(ClientHandshake::new(token, now));
        info!(servers = ?token.addresses, timeout = token.timeout, "connecting");
        self.poll_handshake(now);
    }

    /// Tear down every session and handshake.
    ///
    /// Each live session queues redundant disconnect packets and a
    /// `Disconnected(Shutdown)` event.
    pub fn stop(&mut self, now: Instant) {
        self.now = now;
        let ids: Vec<SessionId> = self.peers.keys().copied().collect();
        for id in ids {
            self.close(id, DisconnectReason::Shutdown, true);
        }
        self.role = Role::Idle;
        self.handshake = None;
        self.acceptances.clear();
        self.history = TokenHistory::new(MAX_TOKEN_HISTORY);
        self.endpoints.clear();
        info!("stopped");
    }

    /// Whether the engine is listening.
    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// Whether a client handshake is in progress.
    pub fn is_connecting(&self) -> bool {
        self.handshake.is_some()
    }

    /// Whether the engine is idle.
    pub fn is_stopped(&self) -> bool {
        match self.role {
            Role::Idle => true,
            Role::Server(_) => false,
            Role::Client => self.handshake.is_none() && self.peers.is_empty(),
        }
    }

    /// Nanoseconds since the engine was created, as of `now`.
    pub fn local_time(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start).as_nanos() as u64
    }

    /// Socket time in nanoseconds.
    ///
    /// On a connected client this is corrected by the estimated server clock
    /// offset, so both ends read roughly the same value.
    pub fn time(&self) -> u64 {
        let local = self.local_time(self.now) as i128;
        let offset = self
            .peers
            .values()
            .find(|peer| peer.side() == Side::Client)
            .map_or(0, |peer| peer.heartbeat().clock_offset()) as i128;
        (local + offset).max(0) as u64
    }

    /// Advance the engine clock without running timers.
    pub fn advance(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Next datagram to send.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        let transmit = self.transmits.pop_front()?;
        self.traffic.on_sent(transmit.bytes.len());
        Some(transmit)
    }

    /// Next event to dispatch.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Handle a datagram received on `endpoint` from `from`.
    pub fn handle_datagram(&mut self, endpoint: usize, from: SocketAddr, datagram: &[u8], now: Instant) {
        self.advance(now);
        self.traffic.on_received(datagram.len());

        let result = match peek_type(datagram) {
            Ok(PacketType::ConnectionRequest) => self.on_request(endpoint, from, datagram, now),
            Ok(_) => self.on_sealed(endpoint, from, datagram, now),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            if err.is_security_error() {
                debug!(%from, %err, "unauthenticated datagram");
            } else if err.is_silent_drop() {
                trace!(%from, %err, "dropped datagram");
            } else {
                debug!(%from, %err, "rejected datagram");
            }
        }
    }

    /// Run timers: idle timeouts, retransmissions, keep-alives, handshake
    /// expiry, reception expiry and token history pruning.
    pub fn update(&mut self, now: Instant) {
        self.advance(now);
        let local_time = self.local_time(now);

        let timed_out: Vec<SessionId> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(now))
            .map(|peer| peer.session_id)
            .collect();
        for id in timed_out {
            self.close(id, DisconnectReason::Timeout, true);
        }

        let mut faulted = Vec::new();
        for peer in self.peers.values_mut() {
            if let Err(err) = peer.poll_retransmits(now) {
                warn!(session = %peer.session_id, %err, "retransmission failed");
                faulted.push((peer.session_id, DisconnectReason::RetransmitLimit));
                continue;
            }

            let mut datagrams = Vec::new();
            let mut result = peer.flush(now, &mut datagrams);
            if result.is_ok()
                && datagrams.is_empty()
                && peer.wants_keep_alive(now, self.config.keepalive_interval)
            {
                result = peer.keep_alive(now, local_time).map(|datagram| datagrams.push(datagram));
            }
            for bytes in datagrams {
                self.transmits.push_back(Transmit {
                    endpoint: peer.endpoint,
                    to: peer.address,
                    bytes,
                });
            }
            if let Err(err) = result {
                warn!(session = %peer.session_id, %err, "sealing failed");
                faulted.push((peer.session_id, DisconnectReason::ProtocolViolation));
                continue;
            }

            peer.dispatcher_mut()
                .expire_receptions(now, self.config.reception_timeout);
        }
        for (id, reason) in faulted {
            self.close(id, reason, true);
        }

        self.acceptances.retain(|_, record| !record.is_expired(now));
        self.poll_handshake(now);
        self.history.prune(unix_time_ms());
    }

    /// Seal queued parcels of every peer.
    pub fn flush(&mut self, now: Instant) {
        let ids: Vec<SessionId> = self.peers.keys().copied().collect();
        for id in ids {
            self.flush_peer(id, now);
        }
    }

    /// Live session IDs.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.peers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Facade over a live session, or one whose `Disconnected` event is not
    /// dispatched yet.
    pub fn session(&mut self, id: SessionId) -> Option<Session<'_>> {
        if self.peers.contains_key(&id) || self.departed.contains_key(&id) {
            Some(Session::new(self, id))
        } else {
            None
        }
    }

    /// Release what remains of a session after its `Disconnected` event.
    pub fn forget(&mut self, id: SessionId) {
        self.departed.remove(&id);
    }

    /// Copy a delivered payload into pooled storage as a read-only message.
    pub fn message(&mut self, payload: &[u8]) -> Message {
        let mut storage = self.pool.acquire(payload.len());
        storage.extend_from_slice(payload);
        Message::received(storage)
    }

    /// Return a delivered message's storage to the pool.
    pub fn recycle(&mut self, message: Message) {
        self.pool.release(message.into_storage());
    }

    /// Snapshot of the engine counters.
    pub fn statistics(&self) -> Statistics {
        let peers = self.peers.len();
        let channels: usize = self
            .peers
            .values()
            .map(|peer| peer.dispatcher().channel_count())
            .sum();
        let handshakes = usize::from(self.handshake.is_some());

        Statistics {
            api: ApiStatistics {
                messages: self.pool.outstanding(),
                sessions: peers,
                channels,
            },
            buffer: BufferStatistics {
                buffers: self.pool.idle(),
            },
            platform: self.traffic.snapshot(),
            protocol: ProtocolStatistics {
                peers,
                servers: usize::from(self.is_server()),
                clients: usize::from(matches!(self.role, Role::Client) && !self.is_stopped()),
                crypto_contexts: peers + handshakes,
                acceptances: self.acceptances.len(),
                handshakes,
                token_history: self.history.len(),
            },
            delivery: DeliveryStatistics {
                dispatchers: peers,
                senders: channels,
                receivers: channels,
                endpoints: self.endpoints.len(),
                buses: usize::from(!self.endpoints.is_empty()),
                receptions: self.peers.values().map(|p| p.dispatcher().receptions()).sum(),
                transmissions: self.peers.values().map(|p| p.dispatcher().transmissions()).sum(),
                parcels: self.peers.values().map(|p| p.dispatcher().parcels()).sum(),
                heartbeats: peers,
            },
        }
    }

    pub(crate) fn peer(&self, id: SessionId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub(crate) fn peer_mut(&mut self, id: SessionId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub(crate) fn departed(&self, id: SessionId) -> Option<&Departed> {
        self.departed.get(&id)
    }

    pub(crate) fn departed_mut(&mut self, id: SessionId) -> Option<&mut Departed> {
        self.departed.get_mut(&id)
    }

    /// Queue `payload` for a session. Returns the parcels queued, 0 when
    /// nothing was sent.
    pub(crate) fn send(&mut self, id: SessionId, channel: usize, payload: &[u8]) -> usize {
        let now = self.now;
        let Some(peer) = self.peers.get_mut(&id) else {
            return 0;
        };
        match peer.dispatcher_mut().send(channel, payload, now) {
            Ok(parcels) => {
                self.flush_peer(id, now);
                parcels
            }
            Err(err) => {
                debug!(session = %id, channel, %err, "send refused");
                0
            }
        }
    }

    /// Close a session at the application's request.
    pub(crate) fn disconnect(&mut self, id: SessionId) -> bool {
        self.close(id, DisconnectReason::Requested, true)
    }

    fn flush_peer(&mut self, id: SessionId, now: Instant) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let mut datagrams = Vec::new();
        let result = peer.flush(now, &mut datagrams);
        for bytes in datagrams {
            self.transmits.push_back(Transmit {
                endpoint: peer.endpoint,
                to: peer.address,
                bytes,
            });
        }
        if let Err(err) = result {
            warn!(session = %id, %err, "sealing failed");
            self.close(id, DisconnectReason::ProtocolViolation, false);
        }
    }

    fn close(&mut self, id: SessionId, reason: DisconnectReason, notify_remote: bool) -> bool {
        let Some(mut peer) = self.peers.remove(&id) else {
            return false;
        };
        self.addresses.remove(&peer.address);
        self.acceptances.remove(&peer.address);

        if notify_remote {
            // Queued parcels and owed acks leave ahead of the disconnect.
            let mut datagrams = Vec::new();
            let mut flushed = peer.flush(self.now, &mut datagrams);
            if flushed.is_ok() && peer.dispatcher().has_pending_acks() {
                let local_time = self.local_time(self.now);
                flushed = peer.keep_alive(self.now, local_time).map(|bytes| datagrams.push(bytes));
            }
            if let Err(err) = flushed {
                debug!(session = %id, %err, "final flush failed");
            }
            for bytes in datagrams {
                self.transmits.push_back(Transmit {
                    endpoint: peer.endpoint,
                    to: peer.address,
                    bytes,
                });
            }
            for _ in 0..DISCONNECT_REDUNDANCY {
                match peer.seal(&Packet::Disconnect, self.now) {
                    Ok(bytes) => self.transmits.push_back(Transmit {
                        endpoint: peer.endpoint,
                        to: peer.address,
                        bytes,
                    }),
                    Err(_) => break,
                }
            }
        }
        peer.dispatcher_mut().clear();

        debug!(session = %id, ?reason, address = %peer.address, "session closed");
        self.departed.insert(
            id,
            Departed {
                client_id: peer.client_id,
                address: peer.address,
                data: peer.data.take(),
                rtt: peer.heartbeat().rtt(),
            },
        );
        self.events.push_back(Event::Disconnected(id, reason));
        true
    }

    fn poll_handshake(&mut self, now: Instant) {
        let Some(handshake) = self.handshake.as_mut() else {
            return;
        };
        if handshake.poll(now, self.config.handshake_resend_interval) {
            for &to in handshake.addresses() {
                self.transmits.push_back(Transmit {
                    endpoint: endpoint_for(&self.endpoints, to),
                    to,
                    bytes: handshake.request().to_vec(),
                });
            }
        }
        if let Some(result) = handshake.state().result() {
            self.finish_handshake(result);
        }
    }

    fn finish_handshake(&mut self, result: ConnectResult) {
        self.handshake = None;
        if result != ConnectResult::Success {
            self.role = Role::Idle;
        }
        info!(?result, "handshake finished");
        self.events.push_back(Event::ConnectResult(result));
    }

    fn on_request(
        &mut self,
        endpoint: usize,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> TransportResult<()> {
        let request = ConnectionRequest::decode(datagram)?;
        let (token, protocol_id, max_clients) = match &self.role {
            Role::Server(server) => (
                verify_private(&server.key, server.protocol_id, &request.token, unix_time_ms())?,
                server.protocol_id,
                server.max_clients,
            ),
            _ => return Err(TransportError::UnknownSession),
        };
        if !lists_endpoint(&self.endpoints, &token.addresses) {
            return Err(TransportError::AddressNotListed);
        }

        match self.history.check(&request.token.nonce, from) {
            TokenUse::Repeated => {
                if let Some(record) = self.acceptances.get(&from).copied() {
                    trace!(%from, session = %record.session_id, "repeating acceptance");
                    self.send_accepted(record.session_id, now)?;
                }
                return Ok(());
            }
            TokenUse::Replayed => {
                debug!(%from, "replayed token denied");
                self.deny(endpoint, from, protocol_id, &token, DenyReason::Replayed)?;
                return Ok(());
            }
            TokenUse::Fresh => {}
        }

        if self.addresses.contains_key(&from) {
            trace!(%from, "address already has a session");
            return Ok(());
        }
        if self.peers.len() >= max_clients {
            debug!(%from, max_clients, "server full");
            self.deny(endpoint, from, protocol_id, &token, DenyReason::ServerFull)?;
            return Ok(());
        }
        if !self.history.insert(
            request.token.nonce,
            from,
            request.token.expire_timestamp,
            unix_time_ms(),
        ) {
            warn!(%from, "token history full");
            self.deny(endpoint, from, protocol_id, &token, DenyReason::ServerFull)?;
            return Ok(());
        }

        let session_id = SessionId::new(self.next_session_id);
        self.next_session_id += 1;
        let timeout = token_timeout(token.timeout);
        let crypto = CryptoContext::server(
            protocol_id,
            Key::from_bytes(token.client_to_server_key),
            Key::from_bytes(token.server_to_client_key),
        );
        let peer = Peer::new(
            session_id,
            token.client_id,
            from,
            endpoint,
            Side::Server,
            crypto,
            Dispatcher::new(&self.config.channel_modes, self.config.delivery()),
            timeout,
            now,
        );

        self.acceptances
            .insert(from, ServerHandshake::new(session_id, now, timeout));
        self.addresses.insert(from, session_id);
        self.peers.insert(session_id, peer);
        self.send_accepted(session_id, now)?;

        debug!(session = %session_id, client_id = token.client_id, %from, "session accepted");
        self.events.push_back(Event::Connected(session_id));
        Ok(())
    }

    fn send_accepted(&mut self, id: SessionId, now: Instant) -> TransportResult<()> {
        let server_time = self.local_time(now);
        let peer = self.peers.get_mut(&id).ok_or(TransportError::UnknownSession)?;
        let packet = Packet::Accepted(Accepted {
            session_id: id.get(),
            client_id: peer.client_id,
            server_time,
        });
        let bytes = peer.seal(&packet, now)?;
        self.transmits.push_back(Transmit {
            endpoint: peer.endpoint,
            to: peer.address,
            bytes,
        });
        Ok(())
    }

    fn deny(
        &mut self,
        endpoint: usize,
        to: SocketAddr,
        protocol_id: u64,
        token: &PrivateToken,
        reason: DenyReason,
    ) -> TransportResult<()> {
        let mut crypto = CryptoContext::server(
            protocol_id,
            Key::from_bytes(token.client_to_server_key),
            Key::from_bytes(token.server_to_client_key),
        )
        .with_send_sequence(DENIAL_SEQUENCE_BASE + self.denials);
        self.denials += 1;
        let bytes = Packet::Denied(reason).seal(&mut crypto)?;
        self.transmits.push_back(Transmit {
            endpoint,
            to,
            bytes,
        });
        Ok(())
    }

    fn on_sealed(
        &mut self,
        endpoint: usize,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> TransportResult<()> {
        if let Some(&id) = self.addresses.get(&from) {
            return self.on_peer_datagram(id, datagram, now);
        }

        let handshake = self.handshake.as_mut().ok_or(TransportError::UnknownSession)?;
        let accepted = handshake.on_datagram(from, datagram)?;
        match accepted {
            Some(accepted) => self.on_accepted(endpoint, from, accepted, now),
            None => {
                if let Some(result) = handshake.state().result() {
                    self.finish_handshake(result);
                }
                Ok(())
            }
        }
    }

    fn on_accepted(
        &mut self,
        endpoint: usize,
        from: SocketAddr,
        accepted: Accepted,
        now: Instant,
    ) -> TransportResult<()> {
        let Some(handshake) = self.handshake.take() else {
            return Err(TransportError::UnknownSession);
        };
        let timeout = handshake.timeout();
        let session_id = SessionId::new(accepted.session_id);
        let local_time = self.local_time(now);

        let mut peer = Peer::new(
            session_id,
            accepted.client_id,
            from,
            endpoint,
            Side::Client,
            handshake.into_crypto(),
            Dispatcher::new(&self.config.channel_modes, self.config.delivery()),
            timeout,
            now,
        );
        peer.heartbeat_mut()
            .observe_peer_clock(accepted.server_time, local_time);

        // Confirms the session so the server retires its acceptance record.
        let bytes = peer.keep_alive(now, local_time)?;
        self.transmits.push_back(Transmit {
            endpoint,
            to: from,
            bytes,
        });

        self.addresses.insert(from, session_id);
        self.peers.insert(session_id, peer);
        debug!(session = %session_id, server = %from, "connected");
        self.events.push_back(Event::Connected(session_id));
        self.finish_handshake(ConnectResult::Success);
        Ok(())
    }

    fn on_peer_datagram(&mut self, id: SessionId, datagram: &[u8], now: Instant) -> TransportResult<()> {
        let local_time = self.local_time(now);
        let peer = self.peers.get_mut(&id).ok_or(TransportError::UnknownSession)?;
        let packet = peer.open(datagram)?;
        self.acceptances.remove(&peer.address);

        let mut delivered = Vec::new();
        let result = peer.receive(packet, now, local_time, &mut delivered);
        self.events
            .extend(delivered.into_iter().map(|Delivered { channel, payload }| Event::Received {
                session: id,
                channel,
                payload,
            }));

        match result {
            Ok(Inbound::Continue) => Ok(()),
            Ok(Inbound::Disconnect) => {
                self.close(id, DisconnectReason::Remote, false);
                Ok(())
            }
            Err(err) if err.is_fatal() => {
                warn!(session = %id, %err, "protocol violation");
                self.close(id, DisconnectReason::ProtocolViolation, true);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Pick the local endpoint whose address family matches `to`.
fn endpoint_for(endpoints: &[SocketAddr], to: SocketAddr) -> usize {
    endpoints
        .iter()
        .position(|local| local.is_ipv4() == to.is_ipv4())
        .unwrap_or(0)
}

/// Whether a token lists one of the bound endpoints. A wildcard bind matches
/// any address with the same port.
fn lists_endpoint(endpoints: &[SocketAddr], listed: &[SocketAddr]) -> bool {
    listed.iter().any(|address| {
        endpoints.iter().any(|local| {
            local == address || (local.ip().is_unspecified() && local.port() == address.port())
        })
    })
}
