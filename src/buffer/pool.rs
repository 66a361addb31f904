//! Recycling of message storage.

use bytes::BytesMut;

/// Default number of idle buffers retained.
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Free list of byte buffers backing delivered messages.
///
/// Storage handed to a listener callback returns here once the callback
/// is done, so steady traffic does not allocate per message.
#[derive(Debug)]
pub struct MessagePool {
    free: Vec<BytesMut>,
    max_idle: usize,
    /// Buffers currently lent out
    outstanding: usize,
}

impl MessagePool {
    /// Create a pool keeping at most `max_idle` idle buffers.
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Vec::new(),
            max_idle,
            outstanding: 0,
        }
    }

    /// Take an empty buffer able to hold `len` bytes.
    pub fn acquire(&mut self, len: usize) -> BytesMut {
        self.outstanding += 1;
        match self.free.pop() {
            Some(mut buf) => {
                buf.reserve(len);
                buf
            }
            None => BytesMut::with_capacity(len),
        }
    }

    /// Hand a buffer back.
    pub fn release(&mut self, mut buf: BytesMut) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.max_idle {
            buf.clear();
            self.free.push(buf);
        }
    }

    /// Buffers lent out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Idle buffers ready for reuse.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}
