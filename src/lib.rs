//! # Courier
//!
//! Secure, connection-oriented transport over UDP.
//!
//! Courier authenticates clients with opaque **connect tokens** issued by a
//! trusted backend, encrypts every packet after the handshake, and moves
//! application messages over a fixed set of **channels**, each of which is
//! unreliable, sequenced (latest wins) or reliable (ordered, retransmitted).
//! Messages larger than one datagram are fragmented and reassembled.
//!
//! - **Security**: XChaCha20-Poly1305 tokens and packets, anti-replay
//! - **Delivery**: per-channel modes with fragmentation and selective acks
//! - **Liveness**: keep-alives, RTT estimation, idle timeouts
//! - **Sans-IO**: the [`socket::Engine`] performs no I/O and is driven by
//!   datagrams and `Instant`s; [`socket::Socket`] is the tokio driver
//!
//! ## Feature Flags
//!
//! - `socket` (default): tokio UDP endpoints and the [`socket::Socket`] loop
//!
//! ## Modules
//!
//! - [`core`]: constants, identifiers, error types and the listener trait
//! - [`crypto`]: keys, AEAD, connect tokens, per-session crypto contexts
//! - [`buffer`]: messages and storage recycling
//! - [`transport`]: packet codec and RTT estimation
//! - [`delivery`]: fragmentation and per-channel send/receive state
//! - [`protocol`]: handshakes and peers
//! - [`session`]: session and channel handles
//! - [`socket`]: engine, configuration, statistics and the tokio driver
//!
//! ## Example Usage
//!
//! ```rust
//! use courier::prelude::*;
//! use courier::crypto::{random_array, random_key};
//!
//! // A backend issues tokens with the server's private key.
//! let private_key = random_key();
//! let now = unix_time_ms();
//! let token = ConnectToken {
//!     protocol_id: 0x1234,
//!     create_timestamp: now,
//!     expire_timestamp: now + 30_000,
//!     nonce: random_array::<CONNECT_TOKEN_NONCE_BYTES>(),
//!     timeout: 5,
//!     addresses: vec!["127.0.0.1:8888".parse()?],
//!     client_to_server_key: random_key(),
//!     server_to_client_key: random_key(),
//!     client_id: 123,
//!     user_data: Vec::new(),
//! }
//! .encode(&private_key)?;
//!
//! // Clients read the public section.
//! let info = TokenInfo::parse(&token)?;
//! assert_eq!(info.timeout, 5);
//!
//! // Messages are written once and read in the same order.
//! let mut message = Message::new();
//! message.write_i32(25)?;
//! message.write_f64(1.2)?;
//! assert_eq!(message.size(), 12);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod buffer;
pub mod crypto;
pub mod delivery;
pub mod protocol;
pub mod session;
pub mod socket;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::buffer::{Message, MessageMode};
    pub use crate::crypto::{ConnectToken, TokenInfo, unix_time_ms};
    pub use crate::session::{Channel, Rtt, Session};
    pub use crate::socket::{Engine, Event, SocketBuilder, SocketConfig, Statistics, Transmit};

    #[cfg(feature = "socket")]
    pub use crate::socket::{Socket, SocketError, SocketHandle, SocketState};
}

// Re-export commonly used items at crate root
pub use buffer::Message;
pub use core::{ChannelMode, ConnectResult, DisconnectReason, SessionId, SocketListener};
pub use session::Session;

#[cfg(feature = "socket")]
pub use socket::Socket;
