//! Checked read cursor over a byte slice.
//!
//! Writing goes through [`bytes::BufMut`] directly; reading needs bound
//! checks because the input comes off the wire, so every read here returns
//! a [`Truncated`] error instead of panicking.

use bytes::Buf;
use thiserror::Error;

/// A read ran past the end of the input.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("truncated input: needed {needed} bytes, {remaining} remaining")]
pub struct Truncated {
    /// Bytes the read needed.
    pub needed: usize,
    /// Bytes that were left.
    pub remaining: usize,
}

/// Sequential reader with little- and big-endian accessors.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
}

macro_rules! read_fn {
    ($name:ident, $ty:ty, $get:ident) => {
        #[doc = concat!("Read a `", stringify!($ty), "`.")]
        pub fn $name(&mut self) -> Result<$ty, Truncated> {
            self.ensure(std::mem::size_of::<$ty>())?;
            Ok(self.buf.$get())
        }
    };
}

impl<'a> ByteReader<'a> {
    /// Create a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Whether everything was consumed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize) -> Result<(), Truncated> {
        if self.buf.len() < needed {
            return Err(Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    read_fn!(read_u8, u8, get_u8);
    read_fn!(read_i8, i8, get_i8);
    read_fn!(read_u16_le, u16, get_u16_le);
    read_fn!(read_u32_le, u32, get_u32_le);
    read_fn!(read_u64_le, u64, get_u64_le);
    read_fn!(read_i16_le, i16, get_i16_le);
    read_fn!(read_i32_le, i32, get_i32_le);
    read_fn!(read_i64_le, i64, get_i64_le);
    read_fn!(read_f32_le, f32, get_f32_le);
    read_fn!(read_f64_le, f64, get_f64_le);
    read_fn!(read_u16_be, u16, get_u16);
    read_fn!(read_u32_be, u32, get_u32);
    read_fn!(read_u64_be, u64, get_u64);

    /// Borrow the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Truncated> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Copy the next `N` bytes into an array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Truncated> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), Truncated> {
        self.read_bytes(len).map(|_| ())
    }
}
