//! Courier - Delivery engine
//!
//! - [`fragment`]: parcels, splitting and reassembly
//! - [`sender`]: per-channel sequencing and reliable retransmission
//! - [`receiver`]: unreliable, sequenced and reliable receive state
//! - [`dispatcher`]: all channels of one peer plus the ack queue

pub mod dispatcher;
pub mod fragment;
pub mod receiver;
pub mod sender;

pub use dispatcher::{Delivered, DeliverySettings, Dispatcher};
pub use fragment::{Parcel, Reception, split};
pub use receiver::ChannelReceiver;
pub use sender::{ChannelSender, Transmission};
