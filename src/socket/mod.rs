//! Courier - Socket layer
//!
//! - [`engine`]: sans-IO state machine for one socket
//! - [`config`]: socket configuration and builder
//! - [`stats`]: statistics snapshot
//! - [`bus`]: tokio UDP endpoints (feature `socket`)
//! - [`socket`](mod@socket): tokio driver and handle (feature `socket`)

pub mod config;
pub mod engine;
pub mod stats;

#[cfg(feature = "socket")]
#[cfg_attr(docsrs, doc(cfg(feature = "socket")))]
pub mod bus;
#[cfg(feature = "socket")]
#[cfg_attr(docsrs, doc(cfg(feature = "socket")))]
#[allow(clippy::module_inception)]
pub mod socket;

pub use config::{DEFAULT_RECV_BUFFER, SocketBuilder, SocketConfig};
pub use engine::{Engine, Event, Transmit};
pub use stats::{
    ApiStatistics, BufferStatistics, DeliveryStatistics, PlatformStatistics, ProtocolStatistics,
    Statistics,
};

#[cfg(feature = "socket")]
pub use bus::{Bus, Datagram, Endpoint};
#[cfg(feature = "socket")]
pub use socket::{Socket, SocketError, SocketHandle, SocketState};
