//! Courier Echo Demo
//!
//! Runs an echo server and a client in one process. The client connects
//! with a freshly issued connect token, sends a few messages on a reliable
//! channel and waits for each echo.
//!
//! Environment variables:
//! - COURIER_BIND: server address (default 127.0.0.1:8888)
//! - COURIER_ROUNDS: number of messages to echo (default 5)
//! - COURIER_LOG_LEVEL: tracing filter (default info)

use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use courier::crypto::{random_array, random_key};
use courier::prelude::*;
use tokio::sync::mpsc;
use tracing::{info, warn};

const PROTOCOL_ID: u64 = 0x00EC_4000;
const CLIENT_ID: u64 = 123;
const MAX_CLIENTS: usize = 20;

/// Sends every message back on channel 0.
struct EchoServer;

impl SocketListener for EchoServer {
    fn on_connected(&mut self, session: &mut Session<'_>) {
        info!(session = %session.id(), client_id = session.client_id(), "client connected");
    }

    fn on_disconnected(&mut self, session: &mut Session<'_>) {
        info!(session = %session.id(), "client disconnected");
    }

    fn on_received(&mut self, session: &mut Session<'_>, message: &mut Message) {
        let mut reply = Message::with_capacity(message.size());
        let echoed = message
            .read_remaining()
            .and_then(|bytes| reply.write(bytes))
            .is_ok();
        if !echoed || session.send(0, &reply) == 0 {
            warn!(session = %session.id(), "echo not sent");
        }
    }
}

/// Forwards decoded echoes to the main task.
struct EchoClient {
    replies: mpsc::UnboundedSender<(i32, f64, f64, i8)>,
}

impl SocketListener for EchoClient {
    fn on_connected(&mut self, session: &mut Session<'_>) {
        info!(session = %session.id(), "connected to server");
    }

    fn on_disconnected(&mut self, session: &mut Session<'_>) {
        info!(session = %session.id(), rtt = ?session.rtt().mean, "disconnected from server");
    }

    fn on_received(&mut self, _session: &mut Session<'_>, message: &mut Message) {
        let decoded = (|| {
            Ok::<_, MessageError>((
                message.read_i32()?,
                message.read_f64()?,
                message.read_f64()?,
                message.read_i8()?,
            ))
        })();
        match decoded {
            Ok(values) => {
                let _ = self.replies.send(values);
            }
            Err(err) => warn!(%err, "malformed echo"),
        }
    }
}

fn issue_token(private_key: &[u8; KEY_BYTES], server: SocketAddr) -> Result<Vec<u8>, TokenError> {
    let now = unix_time_ms();
    ConnectToken {
        protocol_id: PROTOCOL_ID,
        create_timestamp: now,
        expire_timestamp: now + 30_000,
        nonce: random_array::<CONNECT_TOKEN_NONCE_BYTES>(),
        timeout: 5,
        addresses: vec![server],
        client_to_server_key: random_key(),
        server_to_client_key: random_key(),
        client_id: CLIENT_ID,
        user_data: Vec::new(),
    }
    .encode(private_key)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let log_level = env::var("COURIER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level.as_str()).init();

    let bind: SocketAddr = env::var("COURIER_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8888".to_string())
        .parse()?;
    let rounds: usize = env::var("COURIER_ROUNDS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(5);

    let config = SocketBuilder::new()
        .channels([ChannelMode::Reliable, ChannelMode::Unreliable])
        .build()?;

    let private_key = random_key();
    let mut server = Socket::new(config.clone())?;
    server.set_listener(EchoServer);
    server
        .listen(&private_key, PROTOCOL_ID, MAX_CLIENTS, bind)
        .await?;
    let server_addr = server.local_addrs()[0];
    let server_handle = server.handle();
    let server_task = tokio::spawn(async move { server.run().await });

    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    let mut client = Socket::new(config)?;
    client.set_listener(EchoClient {
        replies: replies_tx,
    });

    let result = client.connect(&issue_token(&private_key, server_addr)?).await?;
    info!(?result, "handshake finished");
    if result != ConnectResult::Success {
        server_handle.stop().await?;
        return Err(format!("connection failed: {result:?}").into());
    }
    let session = client.sessions()[0];

    for round in 0..rounds {
        let mut message = Message::new();
        message.write_i32(25 + round as i32)?;
        message.write_f64(1.2)?;
        message.write_f64(0.5)?;
        message.write_i8(1)?;
        client.send(0, &message, &[session]);

        let echo = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(values) = replies.try_recv() {
                    return Ok::<_, SocketError>(values);
                }
                client.poll().await?;
            }
        })
        .await??;
        info!(round, ?echo, rtt = ?client.session(session).map(|s| s.rtt().mean), "echo received");
    }

    info!(statistics = ?client.statistics().platform, "client traffic");
    client.stop();
    server_handle.stop().await?;
    server_task.await??;
    Ok(())
}
