//! Tokio driver for the socket engine.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::bus::{Bus, Datagram};
use super::config::SocketConfig;
use super::engine::{Engine, Event};
use super::stats::Statistics;
use crate::buffer::Message;
use crate::core::{ConfigError, ConnectResult, SessionId, SocketListener, TokenError};
use crate::crypto::{Key, TokenInfo};
use crate::session::Session;

/// Commands queued by [`SocketHandle`]s.
const COMMAND_CAPACITY: usize = 256;

/// Errors surfaced by [`Socket`].
#[derive(Debug, Error)]
pub enum SocketError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Private key or connect token rejected.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// A text connect token is not valid base64.
    #[error("invalid base64 token: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Failed to bind an endpoint.
    #[error("bind failed on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: io::Error,
    },

    /// `listen` or `connect` on a socket that is already running.
    #[error("socket is already running")]
    AlreadyRunning,

    /// `listen_all` without addresses.
    #[error("no addresses to listen on")]
    NoAddresses,

    /// The socket is stopped.
    #[error("socket stopped")]
    Stopped,
}

/// Coarse socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Nothing bound.
    Stopped,
    /// A client handshake is in progress.
    Connecting,
    /// Listening, or connected to a server.
    Running,
}

enum Command {
    Send {
        channel: usize,
        payload: Bytes,
        sessions: Vec<SessionId>,
        reply: oneshot::Sender<usize>,
    },
    Disconnect {
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Stop,
}

/// Cloneable handle for driving a socket from other tasks.
///
/// Commands are executed by the socket loop; the futures resolve once
/// the loop has processed them.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    tx: mpsc::Sender<Command>,
}

impl SocketHandle {
    /// Queue `payload` on `channel` for each of `sessions`. Resolves to the
    /// number of sessions it was queued to. A written [`Message`] converts
    /// with [`Message::into_bytes`].
    pub async fn send(
        &self,
        channel: usize,
        payload: impl Into<Bytes>,
        sessions: &[SessionId],
    ) -> Result<usize, SocketError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            channel,
            payload: payload.into(),
            sessions: sessions.to_vec(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SocketError::Stopped)
    }

    /// Close a session.
    pub async fn disconnect(&self, session: SessionId) -> Result<bool, SocketError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect { session, reply }).await?;
        rx.await.map_err(|_| SocketError::Stopped)
    }

    /// Stop the socket.
    pub async fn stop(&self) -> Result<(), SocketError> {
        self.command(Command::Stop).await
    }

    async fn command(&self, command: Command) -> Result<(), SocketError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SocketError::Stopped)
    }
}

enum Wake {
    Datagram(Option<Datagram>),
    Tick,
    Command(Command),
}

/// A courier socket: server, client, or idle.
///
/// All state lives in a sans-IO [`Engine`]; the socket owns the UDP
/// endpoints, the update timer and the listener, and runs callbacks from
/// [`Socket::poll`].
///
/// # Example
///
/// ```ignore
/// let mut server = Socket::new(SocketConfig::default())?;
/// server.set_listener(Echo);
/// server.listen(&private_key, PROTOCOL_ID, 20, "0.0.0.0:8888".parse()?).await?;
/// server.run().await?;
/// ```
pub struct Socket {
    engine: Engine,
    bus: Option<Bus>,
    ticker: Option<Interval>,
    listener: Option<Box<dyn SocketListener + Send>>,
    connect_result: Option<ConnectResult>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
}

impl Socket {
    /// Create an idle socket.
    pub fn new(config: SocketConfig) -> Result<Self, SocketError> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        Ok(Self {
            engine: Engine::new(config, Instant::now()),
            bus: None,
            ticker: None,
            listener: None,
            connect_result: None,
            commands_tx,
            commands_rx,
        })
    }

    /// Register the callback receiver, replacing any previous one.
    pub fn set_listener(&mut self, listener: impl SocketListener + Send + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// Handle for other tasks.
    pub fn handle(&self) -> SocketHandle {
        SocketHandle {
            tx: self.commands_tx.clone(),
        }
    }

    /// Bind `address` and accept connection requests.
    pub async fn listen(
        &mut self,
        private_key: &[u8],
        protocol_id: u64,
        max_clients: usize,
        address: SocketAddr,
    ) -> Result<(), SocketError> {
        self.listen_all(private_key, protocol_id, max_clients, &[address])
            .await
    }

    /// Bind every address in `addresses` and accept connection requests on
    /// all of them.
    pub async fn listen_all(
        &mut self,
        private_key: &[u8],
        protocol_id: u64,
        max_clients: usize,
        addresses: &[SocketAddr],
    ) -> Result<(), SocketError> {
        if !self.engine.is_stopped() {
            return Err(SocketError::AlreadyRunning);
        }
        if addresses.is_empty() {
            return Err(SocketError::NoAddresses);
        }
        Key::from_slice(private_key)?;

        let mut bus = Bus::new(self.engine.config().recv_buffer_size);
        let mut bound = Vec::with_capacity(addresses.len());
        for &addr in addresses {
            bound.push(
                bus.bind(addr)
                    .await
                    .map_err(|source| SocketError::Bind { addr, source })?,
            );
        }

        self.engine
            .listen(private_key, protocol_id, max_clients, bound, Instant::now())?;
        self.start(bus);
        Ok(())
    }

    /// Connect with a connect token, driving the socket until the
    /// handshake finishes.
    ///
    /// On success the socket keeps running; keep calling [`Socket::poll`]
    /// or [`Socket::run`].
    pub async fn connect(&mut self, token: &[u8]) -> Result<ConnectResult, SocketError> {
        if !self.engine.is_stopped() {
            return Err(SocketError::AlreadyRunning);
        }
        let info = TokenInfo::parse(token)?;

        let mut bus = Bus::new(self.engine.config().recv_buffer_size);
        let mut bound = Vec::new();
        let wildcards = [
            (info.addresses.iter().any(SocketAddr::is_ipv4), SocketAddr::from(([0, 0, 0, 0], 0))),
            (info.addresses.iter().any(SocketAddr::is_ipv6), SocketAddr::from(([0u16; 8], 0))),
        ];
        for (needed, addr) in wildcards {
            if needed {
                bound.push(
                    bus.bind(addr)
                        .await
                        .map_err(|source| SocketError::Bind { addr, source })?,
                );
            }
        }

        self.connect_result = None;
        self.engine.connect(&info, bound, Instant::now());
        self.start(bus);
        self.flush();

        loop {
            if let Some(result) = self.connect_result.take() {
                if result != ConnectResult::Success {
                    self.release();
                }
                return Ok(result);
            }
            if self.engine.is_stopped() {
                self.release();
                return Err(SocketError::Stopped);
            }
            self.poll().await?;
        }
    }

    /// [`Socket::connect`] with a base64 encoded connect token.
    pub async fn connect_base64(&mut self, token: &str) -> Result<ConnectResult, SocketError> {
        let token = BASE64.decode(token.trim())?;
        self.connect(&token).await
    }

    /// Wait for one wake-up (datagram, tick or handle command), handle it
    /// and dispatch the resulting callbacks.
    pub async fn poll(&mut self) -> Result<(), SocketError> {
        let (Some(bus), Some(ticker)) = (self.bus.as_mut(), self.ticker.as_mut()) else {
            return Err(SocketError::Stopped);
        };

        let wake = tokio::select! {
            datagram = bus.recv() => Wake::Datagram(datagram),
            _ = ticker.tick() => Wake::Tick,
            Some(command) = self.commands_rx.recv() => Wake::Command(command),
        };

        match wake {
            Wake::Datagram(Some(datagram)) => {
                self.on_datagram(datagram);
                while let Some(datagram) = self.bus.as_mut().and_then(Bus::try_recv) {
                    self.on_datagram(datagram);
                }
            }
            Wake::Datagram(None) => {
                warn!("endpoints closed, stopping");
                self.release();
                self.engine.stop(Instant::now());
                self.dispatch();
                return Err(SocketError::Stopped);
            }
            Wake::Tick => self.engine.update(Instant::now()),
            Wake::Command(command) => self.execute(command),
        }

        self.flush();
        self.dispatch();
        Ok(())
    }

    /// Poll until the socket stops.
    pub async fn run(&mut self) -> Result<(), SocketError> {
        while self.bus.is_some() {
            self.poll().await?;
            if self.engine.is_stopped() {
                self.release();
            }
        }
        Ok(())
    }

    /// Disconnect every session, invoking `on_disconnected` for each before
    /// returning, and release the endpoints.
    pub fn stop(&mut self) {
        self.engine.stop(Instant::now());
        self.flush();
        self.dispatch();
        self.release();
    }

    /// Queue `message` on `channel` for each of `sessions`. Returns the
    /// number of sessions it was queued to.
    pub fn send(&mut self, channel: usize, message: &Message, sessions: &[SessionId]) -> usize {
        let sent = self.send_payload(channel, message.payload(), sessions);
        self.flush();
        sent
    }

    /// Facade over a session.
    pub fn session(&mut self, id: SessionId) -> Option<Session<'_>> {
        self.engine.session(id)
    }

    /// Live session IDs.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.engine.sessions()
    }

    /// Socket time in nanoseconds. See [`Engine::time`].
    pub fn time(&mut self) -> u64 {
        self.engine.advance(Instant::now());
        self.engine.time()
    }

    /// Bound addresses.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bus.as_ref().map(Bus::local_addrs).unwrap_or_default()
    }

    /// Coarse state.
    pub fn state(&self) -> SocketState {
        if self.engine.is_connecting() {
            SocketState::Connecting
        } else if self.engine.is_stopped() {
            SocketState::Stopped
        } else {
            SocketState::Running
        }
    }

    /// Counter snapshot.
    pub fn statistics(&self) -> Statistics {
        self.engine.statistics()
    }

    fn start(&mut self, bus: Bus) {
        let mut ticker = tokio::time::interval(self.engine.config().update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.bus = Some(bus);
        self.ticker = Some(ticker);
    }

    fn release(&mut self) {
        if let Some(mut bus) = self.bus.take() {
            bus.close();
            info!("endpoints released");
        }
        self.ticker = None;
    }

    fn on_datagram(&mut self, datagram: Datagram) {
        self.engine
            .handle_datagram(datagram.endpoint, datagram.from, &datagram.bytes, Instant::now());
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Send {
                channel,
                payload,
                sessions,
                reply,
            } => {
                let sent = self.send_payload(channel, &payload, &sessions);
                let _ = reply.send(sent);
            }
            Command::Disconnect { session, reply } => {
                let _ = reply.send(self.engine.disconnect(session));
            }
            Command::Stop => self.stop(),
        }
    }

    fn send_payload(&mut self, channel: usize, payload: &[u8], sessions: &[SessionId]) -> usize {
        sessions
            .iter()
            .filter(|&&id| self.engine.send(id, channel, payload) > 0)
            .count()
    }

    fn flush(&mut self) {
        match self.bus.as_ref() {
            Some(bus) => {
                while let Some(transmit) = self.engine.poll_transmit() {
                    bus.send(transmit);
                }
            }
            None => while self.engine.poll_transmit().is_some() {},
        }
    }

    fn dispatch(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            match event {
                Event::Connected(id) => {
                    if let (Some(listener), Some(mut session)) =
                        (self.listener.as_mut(), self.engine.session(id))
                    {
                        listener.on_connected(&mut session);
                    }
                }
                Event::Disconnected(id, reason) => {
                    debug!(session = %id, ?reason, "dispatching disconnect");
                    if let (Some(listener), Some(mut session)) =
                        (self.listener.as_mut(), self.engine.session(id))
                    {
                        listener.on_disconnected(&mut session);
                    }
                    self.engine.forget(id);
                }
                Event::Received {
                    session: id,
                    channel,
                    payload,
                } => {
                    trace!(session = %id, channel, len = payload.len(), "dispatching message");
                    let mut message = self.engine.message(&payload);
                    if let (Some(listener), Some(mut session)) =
                        (self.listener.as_mut(), self.engine.session(id))
                    {
                        listener.on_received(&mut session, &mut message);
                    }
                    self.engine.recycle(message);
                }
                Event::ConnectResult(result) => self.connect_result = Some(result),
            }
        }
        // Callbacks may have sent.
        self.flush();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("state", &self.state())
            .field("sessions", &self.engine.sessions().len())
            .field("local_addrs", &self.local_addrs())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::core::{CONNECT_TOKEN_NONCE_BYTES, ChannelMode, KEY_BYTES};
    use crate::crypto::{ConnectToken, random_array, random_key, unix_time_ms};

    const PROTOCOL_ID: u64 = 0xC0DE;
    const KEY: [u8; KEY_BYTES] = [0x42; KEY_BYTES];

    #[derive(Default)]
    struct Log {
        connected: Vec<SessionId>,
        disconnected: Vec<SessionId>,
        received: Vec<Vec<u8>>,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Log>>);

    impl SocketListener for Recorder {
        fn on_connected(&mut self, session: &mut Session<'_>) {
            self.0.lock().unwrap().connected.push(session.id());
        }

        fn on_disconnected(&mut self, session: &mut Session<'_>) {
            self.0.lock().unwrap().disconnected.push(session.id());
        }

        fn on_received(&mut self, _session: &mut Session<'_>, message: &mut Message) {
            let bytes = message.read_remaining().unwrap().to_vec();
            self.0.lock().unwrap().received.push(bytes);
        }
    }

    fn token(server: SocketAddr, timeout: i32) -> Vec<u8> {
        let now = unix_time_ms();
        ConnectToken {
            protocol_id: PROTOCOL_ID,
            create_timestamp: now,
            expire_timestamp: now + 30_000,
            nonce: random_array::<CONNECT_TOKEN_NONCE_BYTES>(),
            timeout,
            addresses: vec![server],
            client_to_server_key: random_key(),
            server_to_client_key: random_key(),
            client_id: 9,
            user_data: Vec::new(),
        }
        .encode(&KEY)
        .unwrap()
    }

    async fn server(recorder: Recorder) -> (Socket, SocketAddr) {
        let mut socket = Socket::new(SocketConfig::default()).unwrap();
        socket.set_listener(recorder);
        socket
            .listen(&KEY, PROTOCOL_ID, 4, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addrs()[0];
        (socket, addr)
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = SocketConfig::with_channels(Vec::<ChannelMode>::new());
        assert!(matches!(Socket::new(config), Err(SocketError::Config(_))));
    }

    #[tokio::test]
    async fn test_listen_rejects_bad_input() {
        let mut socket = Socket::new(SocketConfig::default()).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            socket.listen(&[1, 2, 3], PROTOCOL_ID, 1, addr).await,
            Err(SocketError::Token(_))
        ));
        assert!(matches!(
            socket.listen_all(&KEY, PROTOCOL_ID, 1, &[]).await,
            Err(SocketError::NoAddresses)
        ));
        assert_eq!(socket.state(), SocketState::Stopped);

        socket.listen(&KEY, PROTOCOL_ID, 1, addr).await.unwrap();
        assert_eq!(socket.state(), SocketState::Running);
        assert!(matches!(
            socket.listen(&KEY, PROTOCOL_ID, 1, addr).await,
            Err(SocketError::AlreadyRunning)
        ));
        socket.stop();
        assert_eq!(socket.state(), SocketState::Stopped);
        assert!(socket.local_addrs().is_empty());
    }

    #[tokio::test]
    async fn test_connect_send_and_stop() {
        let server_log = Recorder::default();
        let (mut server, addr) = server(server_log.clone()).await;
        let handle = server.handle();
        let server_task = tokio::spawn(async move {
            server.run().await.unwrap();
            server
        });

        let client_log = Recorder::default();
        let mut client = Socket::new(SocketConfig::default()).unwrap();
        client.set_listener(client_log.clone());
        assert_eq!(
            client.connect(&token(addr, 5)).await.unwrap(),
            ConnectResult::Success
        );
        assert_eq!(client.state(), SocketState::Running);
        let id = client.sessions()[0];
        assert_eq!(client_log.0.lock().unwrap().connected, vec![id]);

        let mut message = Message::new();
        message.write(b"ping").unwrap();
        assert_eq!(client.send(0, &message, &[id]), 1);
        assert_eq!(client.send(0, &message, &[SessionId::new(404)]), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while server_log.0.lock().unwrap().received.is_empty() {
                client.poll().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(server_log.0.lock().unwrap().received, vec![b"ping".to_vec()]);

        // The handle reaches sessions through the server loop.
        let sent = handle.send(0, message.into_bytes(), &[id]).await.unwrap();
        assert_eq!(sent, 1);

        handle.stop().await.unwrap();
        let server = server_task.await.unwrap();
        assert_eq!(server.state(), SocketState::Stopped);
        assert_eq!(server_log.0.lock().unwrap().disconnected.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_times_out_without_server() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = Socket::new(SocketConfig::default()).unwrap();
        let result = client.connect(&token(silent.local_addr().unwrap(), 1)).await.unwrap();
        assert_eq!(result, ConnectResult::TimedOut);
        assert_eq!(client.state(), SocketState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_invokes_disconnect_callbacks() {
        let server_log = Recorder::default();
        let (mut server, addr) = server(server_log.clone()).await;
        let handle = server.handle();

        let client_task = tokio::spawn(async move {
            let mut client = Socket::new(SocketConfig::default()).unwrap();
            let result = client.connect(&token(addr, 5)).await.unwrap();
            // Keep the client alive long enough to be stopped from the server side.
            let _ = tokio::time::timeout(Duration::from_millis(500), client.run()).await;
            result
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while server_log.0.lock().unwrap().connected.is_empty() {
                server.poll().await.unwrap();
            }
        })
        .await
        .unwrap();

        server.stop();
        {
            let log = server_log.0.lock().unwrap();
            assert_eq!(log.disconnected, log.connected);
        }
        assert!(server.sessions().is_empty());
        assert!(handle.stop().await.is_ok());
        assert_eq!(client_task.await.unwrap(), ConnectResult::Success);
    }

    #[tokio::test]
    async fn test_closed_endpoints_stop_socket() {
        let server_log = Recorder::default();
        let (mut socket, _) = server(server_log).await;
        if let Some(bus) = socket.bus.as_mut() {
            bus.close();
        }

        let err = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(err) = socket.poll().await {
                    return err;
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(err, SocketError::Stopped));
        assert!(socket.bus.is_none());
        assert_eq!(socket.state(), SocketState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_base64_token() {
        let (mut server, addr) = server(Recorder::default()).await;
        let server_task = tokio::spawn(async move {
            let _ = tokio::time::timeout(Duration::from_secs(3), server.run()).await;
        });

        let encoded = BASE64.encode(token(addr, 5));
        let mut client = Socket::new(SocketConfig::default()).unwrap();
        assert_eq!(
            client.connect_base64(&encoded).await.unwrap(),
            ConnectResult::Success
        );
        client.stop();

        let mut rejected = Socket::new(SocketConfig::default()).unwrap();
        assert!(matches!(
            rejected.connect_base64("not base64!").await,
            Err(SocketError::Base64(_))
        ));
        assert_eq!(rejected.state(), SocketState::Stopped);
        server_task.await.unwrap();
    }
}
