//! UDP Session Tests
//!
//! Client and server endpoints talking over real sockets on 127.0.0.1.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use peerlink_core::{ClientConfig, ConnectionState, Notification, NotificationKind, ServerConfig};
use peerlink_runtime::{Client, ObserverRegistry, Server};
use peerlink_udp::{UdpConfig, UdpHost, UdpProvider};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

type Recorded = Arc<Mutex<Vec<Notification>>>;

fn record(observers: &ObserverRegistry) -> Recorded {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    observers.subscribe(move |notification| sink.lock().unwrap().push(notification.clone()));
    recorded
}

fn count(recorded: &Recorded, kind: NotificationKind) -> usize {
    recorded.lock().unwrap().iter().filter(|n| n.kind() == kind).count()
}

fn first(recorded: &Recorded, kind: NotificationKind) -> Option<Notification> {
    recorded.lock().unwrap().iter().find(|n| n.kind() == kind).cloned()
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// A port nothing is listening on right now
fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn provider() -> UdpProvider {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    UdpProvider::with_config(UdpConfig::testing())
}

fn server(max_clients: usize) -> (Server<UdpHost>, Recorded, u16) {
    let port = free_port();
    let config = ServerConfig::testing(port, max_clients)
        .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let server = Server::with_config(&provider(), config).unwrap();
    let recorded = record(server.observers());
    server.start_listening().unwrap();
    (server, recorded, port)
}

fn client() -> (Client<UdpHost>, Recorded) {
    let client = Client::with_config(&provider(), ClientConfig::testing()).unwrap();
    let recorded = record(client.observers());
    client.start_listening().unwrap();
    (client, recorded)
}

// ----------------------------------------------------------------------------
// Sessions Over Loopback Sockets
// ----------------------------------------------------------------------------

#[test]
fn client_and_server_exchange_packets() {
    let (server, server_seen, port) = server(4);
    let (client, client_seen) = client();

    client.connect("127.0.0.1", port).unwrap();
    assert!(wait_until(|| count(&client_seen, NotificationKind::Connected) == 1));
    assert!(wait_until(|| server.client_count() == 1));

    let clients = server.connected_clients();
    assert_eq!(clients[0].address(), "127.0.0.1");
    assert_eq!(clients[0].port(), client.transport().local_addr().port());
    assert_eq!(clients[0].connection_state(), ConnectionState::Connected);

    assert!(client.send(&[1, 2, 3]));
    assert!(wait_until(|| count(&server_seen, NotificationKind::Received) == 1));
    let received = first(&server_seen, NotificationKind::Received).unwrap();
    assert_eq!(received.payload(), Some(&[1u8, 2, 3][..]));

    assert!(server.send(b"pong", received.peer()));
    assert!(wait_until(|| count(&client_seen, NotificationKind::Received) == 1));
    let reply = first(&client_seen, NotificationKind::Received).unwrap();
    assert_eq!(reply.payload(), Some(&b"pong"[..]));
    assert_eq!(reply.peer().port(), port);

    client.disconnect(7);
    assert!(wait_until(|| count(&client_seen, NotificationKind::Disconnected) == 1));
    assert!(wait_until(|| count(&server_seen, NotificationKind::Disconnected) == 1));
    assert_eq!(server.client_count(), 0);
    assert!(!client.send(&[4]));

    client.stop_listening().unwrap();
    server.stop_listening().unwrap();
}

#[test]
fn packets_keep_their_order() {
    let (server, server_seen, port) = server(4);
    let (client, client_seen) = client();
    client.connect("127.0.0.1", port).unwrap();
    assert!(wait_until(|| count(&client_seen, NotificationKind::Connected) == 1));

    for index in 0..20u8 {
        assert!(client.send(&[index]));
    }
    assert!(wait_until(|| count(&server_seen, NotificationKind::Received) == 20));

    let payloads: Vec<u8> = server_seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|n| n.payload().map(|bytes| bytes[0]))
        .collect();
    assert_eq!(payloads, (0..20u8).collect::<Vec<_>>());
}

#[test]
fn full_server_refuses_extra_clients() {
    let (server, _server_seen, port) = server(1);
    let (first_client, first_seen) = client();
    first_client.connect("127.0.0.1", port).unwrap();
    assert!(wait_until(|| count(&first_seen, NotificationKind::Connected) == 1));

    let (second, second_seen) = client();
    second.connect("127.0.0.1", port).unwrap();
    assert!(wait_until(|| count(&second_seen, NotificationKind::Disconnected) == 1));
    assert_eq!(count(&second_seen, NotificationKind::Connected), 0);
    assert_eq!(server.client_count(), 1);
}

#[test]
fn connecting_to_a_silent_port_times_out() {
    let (client, client_seen) = client();
    client.connect("127.0.0.1", free_port()).unwrap();

    assert!(wait_until(|| count(&client_seen, NotificationKind::TimedOut) == 1));
    assert_eq!(
        client.server_peer().map(|peer| peer.connection_state()),
        Some(ConnectionState::Zombie)
    );
}
