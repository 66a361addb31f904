//! Courier - Buffers and messages.
//!
//! - [`Message`]: write-only / read-only application payloads
//! - [`ByteReader`]: checked cursor used by the wire codecs
//! - [`MessagePool`]: storage recycling for delivered messages

pub mod cursor;
pub mod message;
pub mod pool;

pub use cursor::{ByteReader, Truncated};
pub use message::{Message, MessageMode};
pub use pool::MessagePool;
