//! Per-socket statistics.

/// Application-facing objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiStatistics {
    /// Delivered messages whose storage has not been recycled.
    pub messages: usize,
    /// Live sessions.
    pub sessions: usize,
    /// Channels across live sessions.
    pub channels: usize,
}

/// Buffer pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatistics {
    /// Idle pooled buffers.
    pub buffers: usize,
}

/// Wire traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformStatistics {
    /// Bytes handed to the network.
    pub sent_bytes: u64,
    /// Bytes received from the network.
    pub recv_bytes: u64,
    /// Datagrams handed to the network.
    pub sent_packets: u64,
    /// Datagrams received from the network.
    pub recv_packets: u64,
}

/// Handshake and session keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolStatistics {
    /// Authenticated peers.
    pub peers: usize,
    /// 1 when listening.
    pub servers: usize,
    /// 1 when connecting or connected.
    pub clients: usize,
    /// Live crypto contexts (peers plus a pending client handshake).
    pub crypto_contexts: usize,
    /// Server acceptances awaiting the client's first packet.
    pub acceptances: usize,
    /// Client handshakes in progress.
    pub handshakes: usize,
    /// Remembered connect token nonces.
    pub token_history: usize,
}

/// Delivery machinery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatistics {
    /// One per peer.
    pub dispatchers: usize,
    /// Channel senders.
    pub senders: usize,
    /// Channel receivers.
    pub receivers: usize,
    /// Bound UDP endpoints.
    pub endpoints: usize,
    /// 1 while any endpoint is bound.
    pub buses: usize,
    /// Incomplete inbound messages.
    pub receptions: usize,
    /// Reliable messages awaiting acknowledgement.
    pub transmissions: usize,
    /// Parcels queued or awaiting acknowledgement.
    pub parcels: usize,
    /// One per peer.
    pub heartbeats: usize,
}

/// Snapshot returned by `Socket::statistics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Application-facing objects.
    pub api: ApiStatistics,
    /// Buffer pool.
    pub buffer: BufferStatistics,
    /// Wire traffic.
    pub platform: PlatformStatistics,
    /// Handshake and session keys.
    pub protocol: ProtocolStatistics,
    /// Delivery machinery.
    pub delivery: DeliveryStatistics,
}

/// Running traffic counters.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Traffic {
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub sent_packets: u64,
    pub recv_packets: u64,
}

impl Traffic {
    pub fn on_sent(&mut self, len: usize) {
        self.sent_bytes += len as u64;
        self.sent_packets += 1;
    }

    pub fn on_received(&mut self, len: usize) {
        self.recv_bytes += len as u64;
        self.recv_packets += 1;
    }

    pub fn snapshot(&self) -> PlatformStatistics {
        PlatformStatistics {
            sent_bytes: self.sent_bytes,
            recv_bytes: self.recv_bytes,
            sent_packets: self.sent_packets,
            recv_packets: self.recv_packets,
        }
    }
}
