//! Server and clients over real UDP sockets.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::crypto::{random_array, random_key};
use courier::prelude::*;

const PROTOCOL_ID: u64 = 0xC0DE_0001;

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connected { client_id: u64 },
    Values { channel_ok: bool, values: (i32, f64, f64, i8) },
    Disconnected { client_id: u64 },
}

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<Seen>>>);

impl Journal {
    fn snapshot(&self) -> Vec<Seen> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, seen: Seen) {
        self.0.lock().unwrap().push(seen);
    }
}

impl SocketListener for Journal {
    fn on_connected(&mut self, session: &mut Session<'_>) {
        self.push(Seen::Connected {
            client_id: session.client_id(),
        });
    }

    fn on_disconnected(&mut self, session: &mut Session<'_>) {
        self.push(Seen::Disconnected {
            client_id: session.client_id(),
        });
    }

    fn on_received(&mut self, session: &mut Session<'_>, message: &mut Message) {
        let values = (
            message.read_i32().unwrap(),
            message.read_f64().unwrap(),
            message.read_f64().unwrap(),
            message.read_i8().unwrap(),
        );
        assert!(message.read_u8().is_err());
        self.push(Seen::Values {
            channel_ok: session.channel_mode(0) == Some(ChannelMode::Reliable),
            values,
        });
    }
}

fn token(private_key: &[u8; KEY_BYTES], server: SocketAddr, client_id: u64) -> Vec<u8> {
    let now = unix_time_ms();
    ConnectToken {
        protocol_id: PROTOCOL_ID,
        create_timestamp: now,
        expire_timestamp: now + 30_000,
        nonce: random_array::<CONNECT_TOKEN_NONCE_BYTES>(),
        timeout: 5,
        addresses: vec![server],
        client_to_server_key: random_key(),
        server_to_client_key: random_key(),
        client_id,
        user_data: vec![0xAB; USER_DATA_BYTES],
    }
    .encode(private_key)
    .unwrap()
}

fn sample() -> Message {
    let mut message = Message::new();
    message.write_i32(25).unwrap();
    message.write_f64(1.2).unwrap();
    message.write_f64(0.5).unwrap();
    message.write_i8(1).unwrap();
    message
}

async fn wait_until(client: &mut Socket, mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            client.poll().await.unwrap();
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_echo_values_on_fixed_port() {
    let private_key = random_key();
    let journal = Journal::default();

    let mut server = Socket::new(SocketConfig::default()).unwrap();
    server.set_listener(journal.clone());
    server
        .listen(&private_key, PROTOCOL_ID, 20, "127.0.0.1:8888".parse().unwrap())
        .await
        .unwrap();
    let server_handle = server.handle();
    let server_task = tokio::spawn(async move { server.run().await });

    let mut client = Socket::new(SocketConfig::default()).unwrap();
    let result = client
        .connect(&token(&private_key, "127.0.0.1:8888".parse().unwrap(), 123))
        .await
        .unwrap();
    assert_eq!(result, ConnectResult::Success);
    let id = client.sessions()[0];
    assert_eq!(client.session(id).unwrap().client_id(), 123);

    assert_eq!(client.send(0, &sample(), &[id]), 1);
    wait_until(&mut client, || journal.snapshot().len() >= 2).await;
    assert_eq!(
        journal.snapshot(),
        vec![
            Seen::Connected { client_id: 123 },
            Seen::Values {
                channel_ok: true,
                values: (25, 1.2, 0.5, 1),
            },
        ]
    );

    assert!(client.session(id).unwrap().disconnect());
    wait_until(&mut client, || journal.snapshot().len() >= 3).await;
    assert_eq!(journal.snapshot()[2], Seen::Disconnected { client_id: 123 });

    server_handle.stop().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_many_clients_on_ephemeral_port() {
    let private_key = random_key();
    let journal = Journal::default();

    let mut server = Socket::new(SocketConfig::default()).unwrap();
    server.set_listener(journal.clone());
    server
        .listen(&private_key, PROTOCOL_ID, 2, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = server.local_addrs()[0];
    assert_ne!(addr.port(), 0);
    let server_handle = server.handle();
    let server_task = tokio::spawn(async move {
        server.run().await.unwrap();
        server
    });

    let mut clients = Vec::new();
    for client_id in [1, 2] {
        let mut client = Socket::new(SocketConfig::default()).unwrap();
        let result = client.connect(&token(&private_key, addr, client_id)).await.unwrap();
        assert_eq!(result, ConnectResult::Success);
        clients.push(client);
    }

    // The server is full.
    let mut rejected = Socket::new(SocketConfig::default()).unwrap();
    let result = rejected.connect(&token(&private_key, addr, 3)).await.unwrap();
    assert_eq!(result, ConnectResult::Denied);
    assert_eq!(rejected.state(), SocketState::Stopped);

    // A stolen token is denied from another address.
    let stolen = token(&private_key, addr, 4);
    let mut owner = Socket::new(SocketConfig::default()).unwrap();
    let mut thief = Socket::new(SocketConfig::default()).unwrap();
    clients[0].stop();
    wait_until(&mut clients[1], || {
        journal
            .snapshot()
            .contains(&Seen::Disconnected { client_id: 1 })
    })
    .await;
    assert_eq!(owner.connect(&stolen).await.unwrap(), ConnectResult::Success);
    assert_eq!(thief.connect(&stolen).await.unwrap(), ConnectResult::Denied);

    server_handle.stop().await.unwrap();
    let server = server_task.await.unwrap();
    assert!(server.sessions().is_empty());
    assert_eq!(server.statistics().protocol.peers, 0);
}
