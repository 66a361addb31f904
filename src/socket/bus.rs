//! UDP endpoints aggregated into one receive stream.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::engine::Transmit;

/// Datagrams buffered between the receive tasks and the socket loop.
const BUS_CAPACITY: usize = 1024;

/// One bound UDP socket.
///
/// Outgoing datagrams are queued to a writer task that awaits the socket,
/// so a send never waits on the caller's side and is never dropped for
/// lack of writability.
#[derive(Debug)]
pub struct Endpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

impl Endpoint {
    /// Bind a new endpoint and start its writer task.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let (outgoing, mut queue) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
        let writer = Arc::clone(&socket);
        // Ends once every sender is gone and the queue is drained.
        tokio::spawn(async move {
            while let Some((to, bytes)) = queue.recv().await {
                if let Err(err) = writer.send_to(&bytes, to).await {
                    debug!(%to, %err, "send failed");
                }
            }
        });

        Ok(Self {
            socket,
            local_addr,
            outgoing,
        })
    }

    /// Address the endpoint is bound to, with the assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a datagram for `to`.
    pub fn send_to(&self, bytes: Bytes, to: SocketAddr) -> io::Result<()> {
        self.outgoing
            .send((to, bytes))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "endpoint writer stopped"))
    }
}

/// A datagram read by one of the endpoints.
#[derive(Debug)]
pub struct Datagram {
    /// Index of the receiving endpoint.
    pub endpoint: usize,
    /// Sender address.
    pub from: SocketAddr,
    /// Datagram bytes.
    pub bytes: Vec<u8>,
}

/// Set of endpoints feeding one channel.
///
/// Each endpoint gets a receive task; the socket loop reads the merged
/// stream with [`Bus::recv`] and sends through [`Bus::send`].
#[derive(Debug)]
pub struct Bus {
    endpoints: Vec<Endpoint>,
    tasks: Vec<JoinHandle<()>>,
    /// Dropped on close, so `recv` ends once the receive tasks are gone.
    tx: Option<mpsc::Sender<Datagram>>,
    rx: mpsc::Receiver<Datagram>,
    recv_buffer_size: usize,
}

impl Bus {
    /// Create an empty bus whose receive tasks read up to
    /// `recv_buffer_size` bytes per datagram.
    pub fn new(recv_buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        Self {
            endpoints: Vec::new(),
            tasks: Vec::new(),
            tx: Some(tx),
            rx,
            recv_buffer_size,
        }
    }

    /// Bind an endpoint and start reading from it. Returns the bound address.
    pub async fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let Some(tx) = self.tx.clone() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "bus closed"));
        };
        let endpoint = Endpoint::bind(addr).await?;
        let local_addr = endpoint.local_addr();
        let index = self.endpoints.len();

        let socket = Arc::clone(&endpoint.socket);
        let mut buffer = vec![0u8; self.recv_buffer_size];
        self.tasks.push(tokio::spawn(async move {
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, from)) => {
                        let datagram = Datagram {
                            endpoint: index,
                            from,
                            bytes: buffer[..len].to_vec(),
                        };
                        if tx.send(datagram).await.is_err() {
                            break;
                        }
                    }
                    // ICMP port unreachable surfaces here on some platforms.
                    Err(err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
                    Err(err) => {
                        warn!(%local_addr, %err, "endpoint receive failed");
                        break;
                    }
                }
            }
        }));

        debug!(%local_addr, index, "endpoint bound");
        self.endpoints.push(endpoint);
        Ok(local_addr)
    }

    /// Bound addresses, in endpoint order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.endpoints.iter().map(Endpoint::local_addr).collect()
    }

    /// Number of bound endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no endpoint is bound.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Put a datagram on the wire.
    pub fn send(&self, transmit: Transmit) {
        let Some(endpoint) = self.endpoints.get(transmit.endpoint) else {
            warn!(endpoint = transmit.endpoint, "no such endpoint");
            return;
        };
        if let Err(err) = endpoint.send_to(Bytes::from(transmit.bytes), transmit.to) {
            warn!(to = %transmit.to, %err, "send failed");
        }
    }

    /// Wait for the next datagram from any endpoint. `None` once the bus is
    /// closed or every receive task ended.
    pub async fn recv(&mut self) -> Option<Datagram> {
        self.rx.recv().await
    }

    /// Next datagram if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Datagram> {
        self.rx.try_recv().ok()
    }

    /// Stop the receive tasks and release the endpoints. Datagrams already
    /// queued are still written.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.endpoints.clear();
        self.tx = None;
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let mut bus = Bus::new(2048);
        let addr = bus.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(bus.local_addrs(), vec![addr]);
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn test_endpoints_merge_into_one_stream() {
        let mut bus = Bus::new(2048);
        let first = bus.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let second = bus.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"one", first).await.unwrap();
        let datagram = bus.recv().await.unwrap();
        assert_eq!((datagram.endpoint, &datagram.bytes[..]), (0, &b"one"[..]));

        peer.send_to(b"two", second).await.unwrap();
        let datagram = bus.recv().await.unwrap();
        assert_eq!((datagram.endpoint, &datagram.bytes[..]), (1, &b"two"[..]));
        assert_eq!(datagram.from, peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_send_from_endpoint() {
        let mut bus = Bus::new(2048);
        bus.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        bus.send(Transmit {
            endpoint: 0,
            to: peer.local_addr().unwrap(),
            bytes: b"hello courier".to_vec(),
        });
        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello courier");
        assert_eq!(from, bus.local_addrs()[0]);

        bus.close();
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_close_drains_queued_datagrams() {
        let mut bus = Bus::new(2048);
        bus.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = peer.local_addr().unwrap();

        for n in 0..3u8 {
            bus.send(Transmit {
                endpoint: 0,
                to,
                bytes: vec![n; 8],
            });
        }
        bus.close();

        let mut buf = [0u8; 64];
        for n in 0..3u8 {
            let received = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf));
            let (len, _) = received.await.unwrap().unwrap();
            assert_eq!(&buf[..len], &[n; 8]);
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_endpoint_is_ignored() {
        let bus = Bus::new(2048);
        bus.send(Transmit {
            endpoint: 3,
            to: "127.0.0.1:9".parse().unwrap(),
            bytes: b"nowhere".to_vec(),
        });
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_closed_bus_ends_stream() {
        let mut bus = Bus::new(2048);
        bus.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        bus.close();

        let next = tokio::time::timeout(Duration::from_secs(5), bus.recv()).await.unwrap();
        assert!(next.is_none());
        assert!(bus.bind("127.0.0.1:0".parse().unwrap()).await.is_err());
    }
}
