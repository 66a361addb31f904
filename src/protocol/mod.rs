//! Courier - Protocol layer
//!
//! - [`handshake`]: client handshake state machine, server acceptance
//!   records and the consumed-token history
//! - [`peer`]: per-session keys, heartbeat and delivery state

pub mod handshake;
pub mod peer;

pub use handshake::{
    ClientHandshake, HandshakeState, ServerHandshake, TokenHistory, TokenUse, token_timeout,
};
pub use peer::{Inbound, Peer, Side};
