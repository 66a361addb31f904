//! Application messages with typed accessors.

use bytes::{BufMut, Bytes, BytesMut};

use super::cursor::{ByteReader, Truncated};
use crate::core::MessageError;

/// Access mode of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMode {
    /// Freshly built by the application; only writes are allowed.
    Write,
    /// Delivered by the engine; only reads are allowed.
    Read,
}

/// An application payload.
///
/// Values are laid out little endian with their natural width. A message
/// built with [`Message::new`] is write-only; a message handed to
/// [`SocketListener::on_received`](crate::core::SocketListener::on_received)
/// is read-only and consumes values in the order they were written.
#[derive(Debug, Clone)]
pub struct Message {
    data: BytesMut,
    mode: MessageMode,
    /// Read position (read mode only)
    cursor: usize,
}

macro_rules! write_fn {
    ($name:ident, $ty:ty, $put:ident) => {
        #[doc = concat!("Append a `", stringify!($ty), "`.")]
        pub fn $name(&mut self, value: $ty) -> Result<(), MessageError> {
            self.ensure_writable()?;
            self.data.$put(value);
            Ok(())
        }
    };
}

macro_rules! read_fn {
    ($name:ident, $ty:ty, $get:ident) => {
        #[doc = concat!("Consume a `", stringify!($ty), "`.")]
        pub fn $name(&mut self) -> Result<$ty, MessageError> {
            self.ensure_readable()?;
            let mut reader = ByteReader::new(&self.data[self.cursor..]);
            let value = reader.$get().map_err(out_of_range)?;
            self.cursor += std::mem::size_of::<$ty>();
            Ok(value)
        }
    };
}

fn out_of_range(err: Truncated) -> MessageError {
    MessageError::OutOfRange {
        requested: err.needed,
        remaining: err.remaining,
    }
}

impl Message {
    /// Create an empty, write-only message.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty, write-only message with preallocated storage.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            mode: MessageMode::Write,
            cursor: 0,
        }
    }

    /// Wrap delivered bytes as a read-only message.
    pub(crate) fn received(data: BytesMut) -> Self {
        Self {
            data,
            mode: MessageMode::Read,
            cursor: 0,
        }
    }

    /// Current access mode.
    pub fn mode(&self) -> MessageMode {
        self.mode
    }

    /// Bytes written (write mode) or bytes left to read (read mode).
    pub fn size(&self) -> usize {
        match self.mode {
            MessageMode::Write => self.data.len(),
            MessageMode::Read => self.data.len() - self.cursor,
        }
    }

    /// Whether [`size`](Self::size) is zero.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn ensure_writable(&self) -> Result<(), MessageError> {
        match self.mode {
            MessageMode::Write => Ok(()),
            MessageMode::Read => Err(MessageError::IllegalState),
        }
    }

    fn ensure_readable(&self) -> Result<(), MessageError> {
        match self.mode {
            MessageMode::Read => Ok(()),
            MessageMode::Write => Err(MessageError::IllegalState),
        }
    }

    write_fn!(write_u8, u8, put_u8);
    write_fn!(write_i8, i8, put_i8);
    write_fn!(write_u16, u16, put_u16_le);
    write_fn!(write_i16, i16, put_i16_le);
    write_fn!(write_u32, u32, put_u32_le);
    write_fn!(write_i32, i32, put_i32_le);
    write_fn!(write_u64, u64, put_u64_le);
    write_fn!(write_i64, i64, put_i64_le);
    write_fn!(write_f32, f32, put_f32_le);
    write_fn!(write_f64, f64, put_f64_le);

    /// Append raw bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
        self.ensure_writable()?;
        self.data.put_slice(bytes);
        Ok(())
    }

    read_fn!(read_u8, u8, read_u8);
    read_fn!(read_i8, i8, read_i8);
    read_fn!(read_u16, u16, read_u16_le);
    read_fn!(read_i16, i16, read_i16_le);
    read_fn!(read_u32, u32, read_u32_le);
    read_fn!(read_i32, i32, read_i32_le);
    read_fn!(read_u64, u64, read_u64_le);
    read_fn!(read_i64, i64, read_i64_le);
    read_fn!(read_f32, f32, read_f32_le);
    read_fn!(read_f64, f64, read_f64_le);

    /// Consume `len` raw bytes.
    pub fn read(&mut self, len: usize) -> Result<&[u8], MessageError> {
        self.ensure_readable()?;
        let remaining = self.data.len() - self.cursor;
        if len > remaining {
            return Err(MessageError::OutOfRange {
                requested: len,
                remaining,
            });
        }
        let start = self.cursor;
        self.cursor += len;
        Ok(&self.data[start..self.cursor])
    }

    /// Consume everything that is left.
    pub fn read_remaining(&mut self) -> Result<&[u8], MessageError> {
        let len = self.size();
        self.read(len)
    }

    /// Bytes that go on the wire when this message is sent.
    pub(crate) fn payload(&self) -> &[u8] {
        match self.mode {
            MessageMode::Write => &self.data,
            MessageMode::Read => &self.data[self.cursor..],
        }
    }

    /// Freeze the unread payload, for handing a written message to
    /// another task without copying.
    pub fn into_bytes(self) -> Bytes {
        let cursor = match self.mode {
            MessageMode::Write => 0,
            MessageMode::Read => self.cursor,
        };
        self.data.freeze().slice(cursor..)
    }

    /// Give the backing storage back for reuse.
    pub(crate) fn into_storage(self) -> BytesMut {
        self.data
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}
