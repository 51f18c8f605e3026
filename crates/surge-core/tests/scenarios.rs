//! End-to-end scenarios against an in-memory `LoopbackHub`, covering the
//! numbered scenarios from the connection-engine design (happy connect,
//! a lossy reliable send, server-full rejection, timeout, kick, relay).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use surge_core::header::{DisconnectReason, RejectReason};
use surge_core::transport::LoopbackHub;
use surge_core::{Client, PeerConfig, Server, ServerConfig};
use surge_binary::BinaryWriter;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn fast_peer_config() -> PeerConfig {
    PeerConfig {
        timeout_ms: 120,
        heartbeat_interval_ms: 40,
        connect_timeout_ms: 500,
        socket_buffer_size: 64 * 1024,
    }
}

fn with_message_id(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + payload.len());
    bytes.write_u16(id).unwrap();
    bytes.extend_from_slice(payload);
    bytes
}

async fn pump(millis: u64, rounds: u32, mut tick: impl FnMut()) {
    for _ in 0..rounds {
        tick();
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[tokio::test]
async fn s1_happy_connect() {
    let hub = LoopbackHub::new();
    let server_addr = addr(17001);
    let client_addr = addr(17002);

    let (server_transport, server_rx) = hub.endpoint(server_addr);
    let (client_transport, client_rx) = hub.endpoint(client_addr);

    let mut server = Server::new(server_transport, server_rx, ServerConfig::new(4));
    let connected_ids = Arc::new(Mutex::new(Vec::new()));
    let connected_ids_clone = Arc::clone(&connected_ids);
    server
        .on_client_connected
        .subscribe(move |e| connected_ids_clone.lock().unwrap().push(e.client_id));

    let mut client = Client::new(client_transport, client_rx, fast_peer_config());
    let client_connected = Arc::new(Mutex::new(None));
    let client_connected_clone = Arc::clone(&client_connected);
    client
        .on_connected
        .subscribe(move |e| *client_connected_clone.lock().unwrap() = Some(e.assigned_id));

    client.connect(server_addr);

    pump(10, 20, || {
        server.tick();
        client.tick();
    })
    .await;

    assert_eq!(*connected_ids.lock().unwrap(), vec![1]);
    assert_eq!(*client_connected.lock().unwrap(), Some(1));
    assert_eq!(server.client_count(), 1);
    assert!(server.has_client(1));
}

#[tokio::test]
async fn s2_lossy_reliable_send_delivers_exactly_once() {
    let hub = LoopbackHub::new();
    let server_addr = addr(17011);
    let client_addr = addr(17012);

    let (server_transport, server_rx) = hub.endpoint(server_addr);
    let (client_transport, client_rx) = hub.endpoint(client_addr);

    // Drop the first two datagrams this client sends toward the server.
    client_transport.set_drop_rule(Arc::new(|_bytes, count| count < 2));

    let mut server = Server::new(server_transport, server_rx, ServerConfig::new(4));
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    server
        .on_message_received
        .subscribe(move |e| received_clone.lock().unwrap().push(e.payload.to_vec()));

    let mut client = Client::new(client_transport, client_rx, fast_peer_config());
    client.connect(server_addr);

    pump(10, 15, || {
        server.tick();
        client.tick();
    })
    .await;

    let payload = with_message_id(7, &[0xDE, 0xAD, 0xBE, 0xEF]);
    client.send_reliable(None, &payload);

    pump(10, 20, || {
        server.tick();
        client.tick();
    })
    .await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[tokio::test]
async fn s3_server_full_rejects_second_client() {
    let hub = LoopbackHub::new();
    let server_addr = addr(17021);
    let a_addr = addr(17022);
    let b_addr = addr(17023);

    let (server_transport, server_rx) = hub.endpoint(server_addr);
    let (a_transport, a_rx) = hub.endpoint(a_addr);
    let (b_transport, b_rx) = hub.endpoint(b_addr);

    let mut server = Server::new(server_transport, server_rx, ServerConfig::new(1));
    let mut client_a = Client::new(a_transport, a_rx, fast_peer_config());
    let mut client_b = Client::new(b_transport, b_rx, fast_peer_config());

    let b_failure = Arc::new(Mutex::new(None));
    let b_failure_clone = Arc::clone(&b_failure);
    client_b
        .on_connection_failed
        .subscribe(move |e| *b_failure_clone.lock().unwrap() = Some(e.reason));

    client_a.connect(server_addr);
    pump(10, 15, || {
        server.tick();
        client_a.tick();
    })
    .await;
    assert_eq!(server.client_count(), 1);

    client_b.connect(server_addr);
    pump(10, 15, || {
        server.tick();
        client_a.tick();
        client_b.tick();
    })
    .await;

    assert_eq!(
        *b_failure.lock().unwrap(),
        Some(surge_core::client::ConnectFailure::Rejected(RejectReason::ServerFull))
    );
}

#[tokio::test]
async fn s4_timeout_disconnects_both_sides_and_frees_id() {
    let hub = LoopbackHub::new();
    let server_addr = addr(17031);
    let client_addr = addr(17032);

    let (server_transport, server_rx) = hub.endpoint(server_addr);
    let (client_transport, client_rx) = hub.endpoint(client_addr);

    let mut server = Server::new(server_transport, server_rx, ServerConfig::new(4));
    let mut client = Client::new(client_transport.clone(), client_rx, fast_peer_config());

    client.connect(server_addr);
    pump(10, 15, || {
        server.tick();
        client.tick();
    })
    .await;
    assert_eq!(server.client_count(), 1);

    // Now silently drop everything the server would otherwise receive.
    client_transport.set_drop_rule(Arc::new(|_bytes, _count| true));

    let client_disconnected = Arc::new(Mutex::new(None));
    let client_disconnected_clone = Arc::clone(&client_disconnected);
    client
        .on_disconnected
        .subscribe(move |e| *client_disconnected_clone.lock().unwrap() = Some(e.reason));

    pump(20, 20, || {
        server.tick();
        client.tick();
    })
    .await;

    assert_eq!(*client_disconnected.lock().unwrap(), Some(DisconnectReason::TimedOut));
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn s5_kick_with_message() {
    let hub = LoopbackHub::new();
    let server_addr = addr(17041);
    let client_addr = addr(17042);

    let (server_transport, server_rx) = hub.endpoint(server_addr);
    let (client_transport, client_rx) = hub.endpoint(client_addr);

    let mut server = Server::new(server_transport, server_rx, ServerConfig::new(4));
    let mut client = Client::new(client_transport, client_rx, fast_peer_config());

    let disconnected = Arc::new(Mutex::new(None));
    let disconnected_clone = Arc::clone(&disconnected);
    client
        .on_disconnected
        .subscribe(move |e| *disconnected_clone.lock().unwrap() = Some(e.reason));

    client.connect(server_addr);
    pump(10, 15, || {
        server.tick();
        client.tick();
    })
    .await;
    assert!(server.has_client(1));

    server.disconnect_client(1, Some(&[0x01]));

    pump(10, 10, || {
        server.tick();
        client.tick();
    })
    .await;

    assert_eq!(*disconnected.lock().unwrap(), Some(DisconnectReason::Kicked));
    assert!(!server.has_client(1));
}

#[tokio::test]
async fn s6_relay_rebroadcasts_without_invoking_server_handler() {
    let hub = LoopbackHub::new();
    let server_addr = addr(17051);
    let a_addr = addr(17052);
    let b_addr = addr(17053);
    let c_addr = addr(17054);

    let (server_transport, server_rx) = hub.endpoint(server_addr);
    let (a_transport, a_rx) = hub.endpoint(a_addr);
    let (b_transport, b_rx) = hub.endpoint(b_addr);
    let (c_transport, c_rx) = hub.endpoint(c_addr);

    let mut server = Server::new(server_transport, server_rx, ServerConfig::new(4));
    server.set_relay_filter([42].into_iter().collect());
    let server_received = Arc::new(Mutex::new(Vec::new()));
    let server_received_clone = Arc::clone(&server_received);
    server
        .on_message_received
        .subscribe(move |e| server_received_clone.lock().unwrap().push(e.message_id));

    let mut client_a = Client::new(a_transport, a_rx, fast_peer_config());
    let mut client_b = Client::new(b_transport, b_rx, fast_peer_config());
    let mut client_c = Client::new(c_transport, c_rx, fast_peer_config());

    let a_received = Arc::new(Mutex::new(Vec::new()));
    let b_received = Arc::new(Mutex::new(Vec::new()));
    let c_received = Arc::new(Mutex::new(Vec::new()));
    for (client, sink) in [
        (&mut client_a, Arc::clone(&a_received)),
        (&mut client_b, Arc::clone(&b_received)),
        (&mut client_c, Arc::clone(&c_received)),
    ] {
        client
            .on_data_received
            .subscribe(move |e| sink.lock().unwrap().push(e.payload.to_vec()));
    }

    client_a.connect(server_addr);
    client_b.connect(server_addr);
    client_c.connect(server_addr);

    pump(10, 20, || {
        server.tick();
        client_a.tick();
        client_b.tick();
        client_c.tick();
    })
    .await;
    assert_eq!(server.client_count(), 3);

    let payload = with_message_id(42, &[0xAB]);
    client_a.send_unreliable(&payload);

    pump(10, 10, || {
        server.tick();
        client_a.tick();
        client_b.tick();
        client_c.tick();
    })
    .await;

    assert!(server_received.lock().unwrap().is_empty());
    assert!(a_received.lock().unwrap().is_empty());
    assert_eq!(b_received.lock().unwrap().len(), 1);
    assert_eq!(c_received.lock().unwrap().len(), 1);
}
