//! Connect tokens.
//!
//! A connect token is issued out of band by an authority holding the
//! server private key. Its public section tells the client where to connect
//! and which session keys to use; its private section is sealed with the
//! server private key and is the only part the server trusts.
//!
//! Layout (little endian, zero padded to [`CONNECT_TOKEN_BYTES`]):
//! ```text
//! [ version (13) | protocol_id (8) | create (8) | expire (8) | nonce (24) |
//!   private section (1024) | timeout (4) | addresses | c2s key (32) | s2c key (32) ]
//! ```
//! Private plaintext, sealed with AAD `version | protocol_id | expire`:
//! ```text
//! [ client_id (8) | timeout (4) | addresses | c2s key (32) | s2c key (32) | user data (256) ]
//! ```
//! Addresses are `count (4)` followed by `type (1) | ip (4 or 16) | port (2)`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BufMut;

use super::aead::{decrypt, encrypt};
use super::keys::Key;
use crate::buffer::ByteReader;
use crate::core::{
    AEAD_TAG_SIZE, AuthFailure, CONNECT_TOKEN_BYTES, CONNECT_TOKEN_NONCE_BYTES,
    CONNECT_TOKEN_PRIVATE_BYTES, KEY_BYTES, MAX_SERVER_ADDRESSES, TokenError, USER_DATA_BYTES,
    VERSION_INFO, VERSION_INFO_BYTES,
};

/// Plaintext size of the private section.
pub const PRIVATE_PLAINTEXT_BYTES: usize = CONNECT_TOKEN_PRIVATE_BYTES - AEAD_TAG_SIZE;

/// Size of the private-section AAD.
const PRIVATE_AAD_BYTES: usize = VERSION_INFO_BYTES + 8 + 8;

const ADDRESS_IPV4: u8 = 1;
const ADDRESS_IPV6: u8 = 2;

/// Current Unix time in milliseconds.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// A decoded connect token.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectToken {
    /// Protocol the token is valid for.
    pub protocol_id: u64,
    /// Creation time (Unix ms).
    pub create_timestamp: u64,
    /// Expiry time (Unix ms). Must be after `create_timestamp`.
    pub expire_timestamp: u64,
    /// Nonce sealing the private section. Must be fresh per token.
    pub nonce: [u8; CONNECT_TOKEN_NONCE_BYTES],
    /// Handshake and idle timeout in seconds; negative disables both.
    pub timeout: i32,
    /// Server addresses the client may connect to.
    pub addresses: Vec<SocketAddr>,
    /// Key for client to server packets.
    pub client_to_server_key: [u8; KEY_BYTES],
    /// Key for server to client packets.
    pub server_to_client_key: [u8; KEY_BYTES],
    /// Application-assigned client identity.
    pub client_id: u64,
    /// Opaque data for the server, at most [`USER_DATA_BYTES`].
    ///
    /// Decoded tokens always carry exactly [`USER_DATA_BYTES`] bytes.
    pub user_data: Vec<u8>,
}

impl ConnectToken {
    /// Encode and seal the token with the server private key.
    ///
    /// Deterministic for identical inputs; freshness comes from `nonce`.
    pub fn encode(&self, private_key: &[u8]) -> Result<Vec<u8>, TokenError> {
        let key = Key::from_slice(private_key)?;
        validate_addresses(&self.addresses)?;
        if self.user_data.len() > USER_DATA_BYTES {
            return Err(TokenError::InvalidLength {
                field: "user data",
                expected: USER_DATA_BYTES,
                actual: self.user_data.len(),
            });
        }
        if self.expire_timestamp <= self.create_timestamp {
            return Err(TokenError::InvalidTimestamps {
                create: self.create_timestamp,
                expire: self.expire_timestamp,
            });
        }

        let private = PrivateToken {
            client_id: self.client_id,
            timeout: self.timeout,
            addresses: self.addresses.clone(),
            client_to_server_key: self.client_to_server_key,
            server_to_client_key: self.server_to_client_key,
            user_data: self.user_data.clone(),
        };
        let sealed = private.seal(&key, self.protocol_id, self.expire_timestamp, &self.nonce)?;

        let mut out = Vec::with_capacity(CONNECT_TOKEN_BYTES);
        out.put_slice(VERSION_INFO);
        out.put_u64_le(self.protocol_id);
        out.put_u64_le(self.create_timestamp);
        out.put_u64_le(self.expire_timestamp);
        out.put_slice(&self.nonce);
        out.put_slice(&sealed);
        out.put_i32_le(self.timeout);
        write_addresses(&mut out, &self.addresses);
        out.put_slice(&self.client_to_server_key);
        out.put_slice(&self.server_to_client_key);
        out.resize(CONNECT_TOKEN_BYTES, 0);
        Ok(out)
    }

    /// Decode a token, verifying it against the server private key.
    ///
    /// Fails with an [`AuthFailure`] when the tag does not verify, when the
    /// protocol ID differs from `protocol_id`, or when `now_ms` is past the
    /// expiry.
    pub fn decode(
        private_key: &[u8],
        protocol_id: u64,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<Self, TokenError> {
        let key = Key::from_slice(private_key)?;
        let info = TokenInfo::parse(bytes)?;
        let private = verify_private(
            &key,
            protocol_id,
            &SealedToken {
                protocol_id: info.protocol_id,
                expire_timestamp: info.expire_timestamp,
                nonce: info.nonce,
                private: info.private_section,
            },
            now_ms,
        )?;

        Ok(Self {
            protocol_id: info.protocol_id,
            create_timestamp: info.create_timestamp,
            expire_timestamp: info.expire_timestamp,
            nonce: info.nonce,
            timeout: private.timeout,
            addresses: private.addresses,
            client_to_server_key: private.client_to_server_key,
            server_to_client_key: private.server_to_client_key,
            client_id: private.client_id,
            user_data: private.user_data,
        })
    }
}

impl fmt::Debug for ConnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectToken")
            .field("protocol_id", &self.protocol_id)
            .field("create_timestamp", &self.create_timestamp)
            .field("expire_timestamp", &self.expire_timestamp)
            .field("timeout", &self.timeout)
            .field("addresses", &self.addresses)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// The public section of a token, readable without the private key.
#[derive(Clone)]
pub struct TokenInfo {
    /// Protocol the token is valid for.
    pub protocol_id: u64,
    /// Creation time (Unix ms).
    pub create_timestamp: u64,
    /// Expiry time (Unix ms).
    pub expire_timestamp: u64,
    /// Nonce sealing the private section.
    pub nonce: [u8; CONNECT_TOKEN_NONCE_BYTES],
    /// Sealed private section, forwarded verbatim to the server.
    pub private_section: [u8; CONNECT_TOKEN_PRIVATE_BYTES],
    /// Timeout in seconds; negative disables.
    pub timeout: i32,
    /// Server addresses.
    pub addresses: Vec<SocketAddr>,
    /// Key for client to server packets.
    pub client_to_server_key: [u8; KEY_BYTES],
    /// Key for server to client packets.
    pub server_to_client_key: [u8; KEY_BYTES],
}

impl TokenInfo {
    /// Parse the public section of an encoded token.
    pub fn parse(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != CONNECT_TOKEN_BYTES {
            return Err(TokenError::InvalidLength {
                field: "token",
                expected: CONNECT_TOKEN_BYTES,
                actual: bytes.len(),
            });
        }

        let mut reader = ByteReader::new(bytes);
        let truncated = |_| TokenError::Malformed("public section truncated");
        if reader.read_bytes(VERSION_INFO_BYTES).map_err(truncated)? != VERSION_INFO {
            return Err(TokenError::Malformed("unknown version"));
        }

        let protocol_id = reader.read_u64_le().map_err(truncated)?;
        let create_timestamp = reader.read_u64_le().map_err(truncated)?;
        let expire_timestamp = reader.read_u64_le().map_err(truncated)?;
        let nonce = reader.read_array().map_err(truncated)?;
        let private_section = reader.read_array().map_err(truncated)?;
        let timeout = reader.read_i32_le().map_err(truncated)?;
        let addresses = read_addresses(&mut reader)?;
        let client_to_server_key = reader.read_array().map_err(truncated)?;
        let server_to_client_key = reader.read_array().map_err(truncated)?;

        Ok(Self {
            protocol_id,
            create_timestamp,
            expire_timestamp,
            nonce,
            private_section,
            timeout,
            addresses,
            client_to_server_key,
            server_to_client_key,
        })
    }
}

impl fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInfo")
            .field("protocol_id", &self.protocol_id)
            .field("expire_timestamp", &self.expire_timestamp)
            .field("timeout", &self.timeout)
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

/// The fields a client forwards to the server in a connection request.
#[derive(Clone)]
pub struct SealedToken {
    /// Protocol ID from the public section.
    pub protocol_id: u64,
    /// Expiry from the public section (bound into the AAD).
    pub expire_timestamp: u64,
    /// Nonce sealing the private section.
    pub nonce: [u8; CONNECT_TOKEN_NONCE_BYTES],
    /// Sealed private section.
    pub private: [u8; CONNECT_TOKEN_PRIVATE_BYTES],
}

impl From<&TokenInfo> for SealedToken {
    fn from(info: &TokenInfo) -> Self {
        Self {
            protocol_id: info.protocol_id,
            expire_timestamp: info.expire_timestamp,
            nonce: info.nonce,
            private: info.private_section,
        }
    }
}

/// The authenticated contents of the private section.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateToken {
    /// Application-assigned client identity.
    pub client_id: u64,
    /// Timeout in seconds; negative disables.
    pub timeout: i32,
    /// Server addresses the token is valid for.
    pub addresses: Vec<SocketAddr>,
    /// Key for client to server packets.
    pub client_to_server_key: [u8; KEY_BYTES],
    /// Key for server to client packets.
    pub server_to_client_key: [u8; KEY_BYTES],
    /// Opaque user data, always [`USER_DATA_BYTES`] long once opened.
    pub user_data: Vec<u8>,
}

impl PrivateToken {
    fn seal(
        &self,
        key: &Key,
        protocol_id: u64,
        expire_timestamp: u64,
        nonce: &[u8; CONNECT_TOKEN_NONCE_BYTES],
    ) -> Result<Vec<u8>, TokenError> {
        let mut plaintext = Vec::with_capacity(PRIVATE_PLAINTEXT_BYTES);
        plaintext.put_u64_le(self.client_id);
        plaintext.put_i32_le(self.timeout);
        write_addresses(&mut plaintext, &self.addresses);
        plaintext.put_slice(&self.client_to_server_key);
        plaintext.put_slice(&self.server_to_client_key);
        plaintext.put_slice(&self.user_data);
        plaintext.resize(plaintext.len() + USER_DATA_BYTES - self.user_data.len(), 0);
        plaintext.resize(PRIVATE_PLAINTEXT_BYTES, 0);

        let aad = private_aad(protocol_id, expire_timestamp);
        encrypt(key, nonce, &aad, &plaintext).map_err(|_| TokenError::Malformed("seal failed"))
    }

    fn open(key: &Key, sealed: &SealedToken) -> Result<Self, TokenError> {
        let aad = private_aad(sealed.protocol_id, sealed.expire_timestamp);
        let plaintext = decrypt(key, &sealed.nonce, &aad, &sealed.private)
            .map_err(|_| AuthFailure::BadTag)?;

        let mut reader = ByteReader::new(&plaintext);
        let truncated = |_| TokenError::Malformed("private section truncated");
        let client_id = reader.read_u64_le().map_err(truncated)?;
        let timeout = reader.read_i32_le().map_err(truncated)?;
        let addresses = read_addresses(&mut reader)?;
        let client_to_server_key = reader.read_array().map_err(truncated)?;
        let server_to_client_key = reader.read_array().map_err(truncated)?;
        let user_data = reader.read_bytes(USER_DATA_BYTES).map_err(truncated)?.to_vec();

        Ok(Self {
            client_id,
            timeout,
            addresses,
            client_to_server_key,
            server_to_client_key,
            user_data,
        })
    }
}

impl fmt::Debug for PrivateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateToken")
            .field("client_id", &self.client_id)
            .field("timeout", &self.timeout)
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

/// Verify a sealed token as a server does on a connection request.
///
/// Cheap checks (protocol, expiry) run before the AEAD.
pub fn verify_private(
    key: &Key,
    protocol_id: u64,
    sealed: &SealedToken,
    now_ms: u64,
) -> Result<PrivateToken, TokenError> {
    if sealed.protocol_id != protocol_id {
        return Err(AuthFailure::ProtocolMismatch {
            expected: protocol_id,
            actual: sealed.protocol_id,
        }
        .into());
    }
    if now_ms > sealed.expire_timestamp {
        return Err(AuthFailure::Expired.into());
    }
    PrivateToken::open(key, sealed)
}

fn private_aad(protocol_id: u64, expire_timestamp: u64) -> [u8; PRIVATE_AAD_BYTES] {
    let mut aad = [0u8; PRIVATE_AAD_BYTES];
    aad[..VERSION_INFO_BYTES].copy_from_slice(VERSION_INFO);
    aad[VERSION_INFO_BYTES..VERSION_INFO_BYTES + 8].copy_from_slice(&protocol_id.to_le_bytes());
    aad[VERSION_INFO_BYTES + 8..].copy_from_slice(&expire_timestamp.to_le_bytes());
    aad
}

fn validate_addresses(addresses: &[SocketAddr]) -> Result<(), TokenError> {
    if addresses.is_empty() || addresses.len() > MAX_SERVER_ADDRESSES {
        return Err(TokenError::InvalidAddresses(addresses.len()));
    }
    Ok(())
}

fn write_addresses(out: &mut Vec<u8>, addresses: &[SocketAddr]) {
    out.put_u32_le(addresses.len() as u32);
    for address in addresses {
        match address.ip() {
            IpAddr::V4(ip) => {
                out.put_u8(ADDRESS_IPV4);
                out.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.put_u8(ADDRESS_IPV6);
                out.put_slice(&ip.octets());
            }
        }
        out.put_u16_le(address.port());
    }
}

fn read_addresses(reader: &mut ByteReader<'_>) -> Result<Vec<SocketAddr>, TokenError> {
    let truncated = |_| TokenError::Malformed("address list truncated");
    let count = reader.read_u32_le().map_err(truncated)? as usize;
    if count == 0 || count > MAX_SERVER_ADDRESSES {
        return Err(TokenError::InvalidAddresses(count));
    }

    let mut addresses = Vec::with_capacity(count);
    for _ in 0..count {
        let ip = match reader.read_u8().map_err(truncated)? {
            ADDRESS_IPV4 => IpAddr::V4(Ipv4Addr::from(
                reader.read_array::<4>().map_err(truncated)?,
            )),
            ADDRESS_IPV6 => IpAddr::V6(Ipv6Addr::from(
                reader.read_array::<16>().map_err(truncated)?,
            )),
            _ => return Err(TokenError::Malformed("unknown address type")),
        };
        let port = reader.read_u16_le().map_err(truncated)?;
        addresses.push(SocketAddr::new(ip, port));
    }
    Ok(addresses)
}
