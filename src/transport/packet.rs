//! Packet encoding and decoding.
//!
//! Every datagram starts with a type byte. The connection request travels
//! in clear (its payload is the sealed private token section); every other
//! packet is `type (1) | sequence (8) | ciphertext` sealed by a
//! [`CryptoContext`].
//!
//! Encrypted bodies:
//! ```text
//! Accepted:   session_id (8) | client_id (8) | server_time (8)
//! Denied:     reason (1)
//! KeepAlive:  ping_time (8) | echo_time (8) | echo_delay (8) | acks
//! Data:       channel (1) | mode (1) | sequence (8) | fragment_index (2) |
//!             fragment_count (2) | length (2) | payload | acks
//! Disconnect: (empty)
//! acks:       count (1) | count * [ channel (1) | sequence (8) | fragment_index (2) ]
//! ```

use bytes::{BufMut, Bytes};
use thiserror::Error;

use crate::delivery::Parcel;
use crate::buffer::{ByteReader, Truncated};
use crate::core::{
    CONNECT_TOKEN_NONCE_BYTES, CONNECT_TOKEN_PRIVATE_BYTES, CONNECTION_REQUEST_BYTES,
    ChannelMode, CryptoError, MAX_ACKS_PER_PACKET, MAX_FRAGMENTS, VERSION_INFO,
    VERSION_INFO_BYTES,
};
use crate::crypto::{CryptoContext, SealedToken};

/// Size of one encoded acknowledgement.
pub const ACK_SIZE: usize = 1 + 8 + 2;

/// Size of the data body header before the payload.
pub const DATA_HEADER_SIZE: usize = 1 + 1 + 8 + 2 + 2 + 2;

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client hello carrying the sealed token (clear).
    ConnectionRequest = 0x00,
    /// Server acceptance.
    ConnectionAccepted = 0x01,
    /// Server denial.
    ConnectionDenied = 0x02,
    /// Liveness probe with RTT timestamps and acks.
    KeepAlive = 0x03,
    /// One parcel plus acks.
    Data = 0x04,
    /// Graceful session teardown.
    Disconnect = 0x05,
}

impl PacketType {
    /// Parse packet type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::ConnectionRequest),
            0x01 => Some(Self::ConnectionAccepted),
            0x02 => Some(Self::ConnectionDenied),
            0x03 => Some(Self::KeepAlive),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Convert packet type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Packet parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Empty datagram.
    #[error("empty datagram")]
    Empty,

    /// Unknown packet type.
    #[error("invalid packet type: {0:#04x}")]
    InvalidType(u8),

    /// Packet shorter or longer than its fixed size.
    #[error("invalid packet length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Required length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Body ended early.
    #[error("truncated body: {0}")]
    Truncated(#[from] Truncated),

    /// Unknown version string.
    #[error("unsupported version")]
    UnsupportedVersion,

    /// Unknown channel mode byte.
    #[error("invalid channel mode: {0}")]
    InvalidMode(u8),

    /// Unknown denial reason.
    #[error("invalid deny reason: {0}")]
    InvalidReason(u8),

    /// Fragment index/count out of range.
    #[error("invalid fragment {index}/{count}")]
    InvalidFragment {
        /// Fragment index.
        index: u16,
        /// Fragment count.
        count: u16,
    },

    /// More acks than a packet may carry.
    #[error("too many acks: {0}")]
    TooManyAcks(usize),

    /// Bytes left after the body.
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),

    /// Packet type not valid in this position.
    #[error("unexpected packet type {0:?}")]
    Unexpected(PacketType),

    /// Sealing or opening failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Why a server refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// `max_clients` sessions are live.
    ServerFull,
    /// The token nonce is in use from another address.
    Replayed,
}

impl DenyReason {
    fn as_byte(self) -> u8 {
        match self {
            DenyReason::ServerFull => 1,
            DenyReason::Replayed => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, PacketError> {
        match byte {
            1 => Ok(DenyReason::ServerFull),
            2 => Ok(DenyReason::Replayed),
            other => Err(PacketError::InvalidReason(other)),
        }
    }
}

/// Acknowledgement of one reliable fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ack {
    /// Channel index.
    pub channel: u8,
    /// Message sequence.
    pub sequence: u64,
    /// Fragment index.
    pub fragment_index: u16,
}

/// Keep-alive body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepAlive {
    /// Sender's socket time (ns) when the packet left.
    pub ping_time: u64,
    /// Latest `ping_time` received from the other side, 0 if none pending.
    pub echo_time: u64,
    /// Nanoseconds between receiving that ping and sending this packet.
    pub echo_delay: u64,
    /// Piggybacked acks.
    pub acks: Vec<Ack>,
}

/// Acceptance body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Session ID assigned by the server.
    pub session_id: u64,
    /// Client ID from the token.
    pub client_id: u64,
    /// Server socket time (ns) when the packet left.
    pub server_time: u64,
}

/// A decoded encrypted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Server acceptance.
    Accepted(Accepted),
    /// Server denial.
    Denied(DenyReason),
    /// Keep-alive.
    KeepAlive(KeepAlive),
    /// Parcel with acks.
    Data {
        /// The parcel.
        parcel: Parcel,
        /// Piggybacked acks.
        acks: Vec<Ack>,
    },
    /// Teardown.
    Disconnect,
}

impl Packet {
    /// Type byte of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Accepted(_) => PacketType::ConnectionAccepted,
            Packet::Denied(_) => PacketType::ConnectionDenied,
            Packet::KeepAlive(_) => PacketType::KeepAlive,
            Packet::Data { .. } => PacketType::Data,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Serialize the plaintext body.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::Accepted(accepted) => {
                out.put_u64_le(accepted.session_id);
                out.put_u64_le(accepted.client_id);
                out.put_u64_le(accepted.server_time);
            }
            Packet::Denied(reason) => out.put_u8(reason.as_byte()),
            Packet::KeepAlive(keep_alive) => {
                out.put_u64_le(keep_alive.ping_time);
                out.put_u64_le(keep_alive.echo_time);
                out.put_u64_le(keep_alive.echo_delay);
                encode_acks(&mut out, &keep_alive.acks);
            }
            Packet::Data { parcel, acks } => {
                out.reserve(DATA_HEADER_SIZE + parcel.payload.len() + 1 + acks.len() * ACK_SIZE);
                out.put_u8(parcel.channel);
                out.put_u8(parcel.mode.as_byte());
                out.put_u64_le(parcel.sequence);
                out.put_u16_le(parcel.fragment_index);
                out.put_u16_le(parcel.fragment_count);
                out.put_u16_le(parcel.payload.len() as u16);
                out.put_slice(&parcel.payload);
                encode_acks(&mut out, acks);
            }
            Packet::Disconnect => {}
        }
        out
    }

    /// Parse a plaintext body of the given type.
    pub fn decode_body(packet_type: PacketType, body: Bytes) -> Result<Self, PacketError> {
        let mut reader = ByteReader::new(&body);
        let packet = match packet_type {
            PacketType::ConnectionRequest => {
                return Err(PacketError::Unexpected(packet_type));
            }
            PacketType::ConnectionAccepted => Packet::Accepted(Accepted {
                session_id: reader.read_u64_le()?,
                client_id: reader.read_u64_le()?,
                server_time: reader.read_u64_le()?,
            }),
            PacketType::ConnectionDenied => Packet::Denied(DenyReason::from_byte(reader.read_u8()?)?),
            PacketType::KeepAlive => Packet::KeepAlive(KeepAlive {
                ping_time: reader.read_u64_le()?,
                echo_time: reader.read_u64_le()?,
                echo_delay: reader.read_u64_le()?,
                acks: decode_acks(&mut reader)?,
            }),
            PacketType::Data => {
                let channel = reader.read_u8()?;
                let mode_byte = reader.read_u8()?;
                let mode =
                    ChannelMode::from_byte(mode_byte).ok_or(PacketError::InvalidMode(mode_byte))?;
                let sequence = reader.read_u64_le()?;
                let fragment_index = reader.read_u16_le()?;
                let fragment_count = reader.read_u16_le()?;
                if fragment_count == 0
                    || fragment_count as usize > MAX_FRAGMENTS
                    || fragment_index >= fragment_count
                {
                    return Err(PacketError::InvalidFragment {
                        index: fragment_index,
                        count: fragment_count,
                    });
                }
                let len = reader.read_u16_le()? as usize;
                let offset = body.len() - reader.remaining();
                reader.skip(len)?;
                let parcel = Parcel {
                    channel,
                    mode,
                    sequence,
                    fragment_index,
                    fragment_count,
                    payload: body.slice(offset..offset + len),
                };
                Packet::Data {
                    parcel,
                    acks: decode_acks(&mut reader)?,
                }
            }
            PacketType::Disconnect => Packet::Disconnect,
        };

        if !reader.is_empty() {
            return Err(PacketError::TrailingBytes(reader.remaining()));
        }
        Ok(packet)
    }

    /// Encode and seal into a datagram.
    pub fn seal(&self, crypto: &mut CryptoContext) -> Result<Vec<u8>, PacketError> {
        Ok(crypto.seal(self.packet_type().as_byte(), &self.encode_body())?)
    }

    /// Open and decode a sealed datagram.
    pub fn open(crypto: &mut CryptoContext, datagram: &[u8]) -> Result<Self, PacketError> {
        let first = *datagram.first().ok_or(PacketError::Empty)?;
        let packet_type = PacketType::from_byte(first).ok_or(PacketError::InvalidType(first))?;
        if packet_type == PacketType::ConnectionRequest {
            return Err(PacketError::Unexpected(packet_type));
        }
        let (_, body) = crypto.open(datagram)?;
        Self::decode_body(packet_type, Bytes::from(body))
    }
}

/// Classify a datagram by its first byte.
pub fn peek_type(datagram: &[u8]) -> Result<PacketType, PacketError> {
    let first = *datagram.first().ok_or(PacketError::Empty)?;
    PacketType::from_byte(first).ok_or(PacketError::InvalidType(first))
}

/// Clear-text connection request.
#[derive(Clone)]
pub struct ConnectionRequest {
    /// Forwarded token fields.
    pub token: SealedToken,
}

impl ConnectionRequest {
    /// Encode into a datagram of exactly [`CONNECTION_REQUEST_BYTES`].
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONNECTION_REQUEST_BYTES);
        out.put_u8(PacketType::ConnectionRequest.as_byte());
        out.put_slice(VERSION_INFO);
        out.put_u64_le(self.token.protocol_id);
        out.put_u64_le(self.token.expire_timestamp);
        out.put_slice(&self.token.nonce);
        out.put_slice(&self.token.private);
        out
    }

    /// Decode a request datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() != CONNECTION_REQUEST_BYTES {
            return Err(PacketError::InvalidLength {
                expected: CONNECTION_REQUEST_BYTES,
                actual: datagram.len(),
            });
        }

        let mut reader = ByteReader::new(datagram);
        let kind = reader.read_u8()?;
        if kind != PacketType::ConnectionRequest.as_byte() {
            return Err(PacketError::InvalidType(kind));
        }
        if reader.read_bytes(VERSION_INFO_BYTES)? != VERSION_INFO {
            return Err(PacketError::UnsupportedVersion);
        }

        let protocol_id = reader.read_u64_le()?;
        let expire_timestamp = reader.read_u64_le()?;
        let nonce = reader.read_array::<CONNECT_TOKEN_NONCE_BYTES>()?;
        let private = reader.read_array::<CONNECT_TOKEN_PRIVATE_BYTES>()?;

        Ok(Self {
            token: SealedToken {
                protocol_id,
                expire_timestamp,
                nonce,
                private,
            },
        })
    }
}

fn encode_acks(out: &mut Vec<u8>, acks: &[Ack]) {
    debug_assert!(acks.len() <= MAX_ACKS_PER_PACKET);
    out.put_u8(acks.len() as u8);
    for ack in acks {
        out.put_u8(ack.channel);
        out.put_u64_le(ack.sequence);
        out.put_u16_le(ack.fragment_index);
    }
}

fn decode_acks(reader: &mut ByteReader<'_>) -> Result<Vec<Ack>, PacketError> {
    let count = reader.read_u8()? as usize;
    if count > MAX_ACKS_PER_PACKET {
        return Err(PacketError::TooManyAcks(count));
    }
    let mut acks = Vec::with_capacity(count);
    for _ in 0..count {
        acks.push(Ack {
            channel: reader.read_u8()?,
            sequence: reader.read_u64_le()?,
            fragment_index: reader.read_u16_le()?,
        });
    }
    Ok(acks)
}
