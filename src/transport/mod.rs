//! Courier - Transport layer
//!
//! - **Packet codec**: [`Packet`], [`ConnectionRequest`] and the wire layout
//!   of every datagram
//! - **RTT estimation**: [`RttEstimator`] and per-peer [`Heartbeat`]
//! - **Errors**: [`TransportError`] with drop/fault classification
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Session / Delivery                  │
//! ├─────────────────────────────────────────┤
//! │     Transport                           │  ← This module
//! │   packets, acks, keep-alives, RTT       │
//! ├─────────────────────────────────────────┤
//! │     Crypto (CryptoContext, tokens)      │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod error;
mod packet;
mod timing;

pub use error::*;
pub use packet::*;
pub use timing::{Heartbeat, Rtt, RttEstimator, constants as timing_constants};
