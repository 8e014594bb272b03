//! Client/Server Session Scenarios
//!
//! End-to-end tests over the in-process loopback network: connect, exchange
//! packets, disconnect, refusals, timeouts and restarts, observed through each
//! endpoint's notifications and queries.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use peerlink_core::{
    ClientConfig, ConnectionState, Notification, NotificationKind, SendError, ServerConfig,
};
use peerlink_harness::{LoopbackHost, LoopbackNetwork};
use peerlink_runtime::{Client, LoopState, Server};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

type Recorded = Arc<Mutex<Vec<Notification>>>;

fn record(observers: &peerlink_runtime::ObserverRegistry) -> Recorded {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    observers.subscribe(move |notification| sink.lock().unwrap().push(notification.clone()));
    recorded
}

fn count(recorded: &Recorded, kind: NotificationKind) -> usize {
    recorded
        .lock()
        .unwrap()
        .iter()
        .filter(|n| n.kind() == kind)
        .count()
}

fn first(recorded: &Recorded, kind: NotificationKind) -> Option<Notification> {
    recorded
        .lock()
        .unwrap()
        .iter()
        .find(|n| n.kind() == kind)
        .cloned()
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn server(network: &LoopbackNetwork, port: u16, max_clients: usize) -> (Server<LoopbackHost>, Recorded) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = Server::with_config(network, ServerConfig::testing(port, max_clients)).unwrap();
    let recorded = record(server.observers());
    server.start_listening().unwrap();
    (server, recorded)
}

fn client(network: &LoopbackNetwork) -> (Client<LoopbackHost>, Recorded) {
    let client = Client::with_config(network, ClientConfig::testing()).unwrap();
    let recorded = record(client.observers());
    client.start_listening().unwrap();
    (client, recorded)
}

fn connected_client(network: &LoopbackNetwork, port: u16) -> (Client<LoopbackHost>, Recorded) {
    let (client, recorded) = client(network);
    client.connect("127.0.0.1", port).unwrap();
    assert!(wait_until(|| count(&recorded, NotificationKind::Connected) == 1));
    (client, recorded)
}

// ----------------------------------------------------------------------------
// Connection Scenarios
// ----------------------------------------------------------------------------

#[test]
fn client_connect_appears_in_server_roster() {
    let network = LoopbackNetwork::new();
    let (server, server_seen) = server(&network, 7200, 4);
    let (client, _client_seen) = connected_client(&network, 7200);
    assert!(wait_until(|| server.client_count() == 1));

    let clients = server.connected_clients();
    assert_eq!(clients.len(), 1);
    let local = client.transport().local_addr();
    assert_eq!(clients[0].address(), local.ip().to_string());
    assert_eq!(clients[0].port(), local.port());
    assert_eq!(clients[0].connection_state(), ConnectionState::Connected);

    let connected = first(&server_seen, NotificationKind::Connected).unwrap();
    assert_eq!(connected.peer().address(), "127.0.0.1");

    let server_peer = client.server_peer().unwrap();
    assert_eq!(server_peer.port(), 7200);
    assert!(server_peer.connection_state().is_connected());
}

#[test]
fn host_names_resolve_before_connecting() {
    let network = LoopbackNetwork::new();
    let (server, _server_seen) = server(&network, 7201, 4);
    let (client, client_seen) = client(&network);

    client.connect("localhost", 7201).unwrap();
    assert!(wait_until(|| count(&client_seen, NotificationKind::Connected) == 1));
    assert!(wait_until(|| server.client_count() == 1));
}

#[test]
fn payload_arrives_intact_with_sender_address() {
    let network = LoopbackNetwork::new();
    let (server, server_seen) = server(&network, 7202, 4);
    let (client, client_seen) = connected_client(&network, 7202);

    assert!(client.send(&[1, 2, 3]));
    assert!(wait_until(|| count(&server_seen, NotificationKind::Received) == 1));

    let received = first(&server_seen, NotificationKind::Received).unwrap();
    assert_eq!(received.payload(), Some(&[1u8, 2, 3][..]));
    assert_eq!(
        received.peer().address(),
        client.transport().local_addr().ip().to_string()
    );

    assert!(server.send(&[9, 8], received.peer()));
    assert!(wait_until(|| count(&client_seen, NotificationKind::Received) == 1));
    let reply = first(&client_seen, NotificationKind::Received).unwrap();
    assert_eq!(reply.payload(), Some(&[9u8, 8][..]));
    assert_eq!(reply.peer().port(), 7202);
}

#[test]
fn client_disconnect_notifies_both_sides() {
    let network = LoopbackNetwork::new();
    let (server, server_seen) = server(&network, 7203, 4);
    let (client, client_seen) = connected_client(&network, 7203);
    assert!(wait_until(|| server.client_count() == 1));

    client.disconnect(7);
    assert!(wait_until(|| count(&client_seen, NotificationKind::Disconnected) == 1));
    assert!(wait_until(|| count(&server_seen, NotificationKind::Disconnected) == 1));
    assert_eq!(server.client_count(), 0);
    assert!(server.connected_clients().is_empty());

    assert!(!client.send(&[1]));
    assert!(matches!(
        client.try_send(0, &[1]),
        Err(SendError::NotConnected { .. })
    ));
    assert_eq!(
        client.server_peer().map(|peer| peer.connection_state()),
        Some(ConnectionState::Disconnected)
    );
}

#[test]
fn full_server_refuses_extra_clients() {
    let network = LoopbackNetwork::new();
    let (server, _server_seen) = server(&network, 7204, 1);
    let (_first, _first_seen) = connected_client(&network, 7204);

    let (second, second_seen) = client(&network);
    second.connect("127.0.0.1", 7204).unwrap();
    assert!(wait_until(|| count(&second_seen, NotificationKind::Disconnected) == 1));
    assert_eq!(count(&second_seen, NotificationKind::Connected), 0);
    assert_eq!(server.client_count(), 1);
    assert!(!second.send(&[1]));
}

#[test]
fn connecting_to_an_unbound_port_times_out() {
    let network = LoopbackNetwork::new();
    let (client, client_seen) = client(&network);

    client.connect("127.0.0.1", 7299).unwrap();
    assert!(wait_until(|| count(&client_seen, NotificationKind::TimedOut) == 1));
    assert_eq!(
        client.server_peer().map(|peer| peer.connection_state()),
        Some(ConnectionState::Zombie)
    );
}

#[test]
fn partitioned_client_times_out_on_both_sides() {
    let network = LoopbackNetwork::new();
    let (server, server_seen) = server(&network, 7205, 4);
    let (client, client_seen) = connected_client(&network, 7205);
    assert!(wait_until(|| server.client_count() == 1));

    assert!(network.partition(client.transport().local_addr()));
    assert!(wait_until(|| count(&server_seen, NotificationKind::TimedOut) == 1));
    assert!(wait_until(|| count(&client_seen, NotificationKind::TimedOut) == 1));
    assert_eq!(server.client_count(), 0);
}

#[test]
fn dropping_a_client_times_it_out_on_the_server() {
    let network = LoopbackNetwork::new();
    let (server, server_seen) = server(&network, 7206, 4);
    let (client, _client_seen) = connected_client(&network, 7206);
    assert!(wait_until(|| server.client_count() == 1));

    drop(client);
    assert!(wait_until(|| count(&server_seen, NotificationKind::TimedOut) == 1));
    assert_eq!(server.client_count(), 0);
}

// ----------------------------------------------------------------------------
// Server Operations
// ----------------------------------------------------------------------------

#[test]
fn broadcast_reaches_every_client() {
    let network = LoopbackNetwork::new();
    let (server, _server_seen) = server(&network, 7207, 4);
    let clients: Vec<_> = (0..3).map(|_| connected_client(&network, 7207)).collect();
    assert!(wait_until(|| server.client_count() == 3));

    assert_eq!(server.broadcast(b"all"), 3);
    for (_, seen) in &clients {
        assert!(wait_until(|| count(seen, NotificationKind::Received) == 1));
        let packet = first(seen, NotificationKind::Received).unwrap();
        assert_eq!(packet.payload(), Some(&b"all"[..]));
    }
}

#[test]
fn server_can_disconnect_a_client() {
    let network = LoopbackNetwork::new();
    let (server, server_seen) = server(&network, 7208, 4);
    let (_client, client_seen) = connected_client(&network, 7208);
    assert!(wait_until(|| server.client_count() == 1));

    let target = server.connected_clients().remove(0);
    assert!(server.disconnect_client(&target, 9));
    assert!(wait_until(|| count(&client_seen, NotificationKind::Disconnected) == 1));
    assert!(wait_until(|| count(&server_seen, NotificationKind::Disconnected) == 1));
    assert_eq!(server.client_count(), 0);
    assert!(!server.send(&[1], &target));
}

#[test]
fn shared_address_resolves_to_most_recent_client() {
    let network = LoopbackNetwork::new();
    let (server, _server_seen) = server(&network, 7209, 4);
    let (_older, older_seen) = connected_client(&network, 7209);
    let (_newer, newer_seen) = connected_client(&network, 7209);
    assert!(wait_until(|| server.client_count() == 2));

    // Both clients live on the loopback IP; the older snapshot still routes to the newer peer
    let older_snapshot = server.connected_clients().remove(0);
    assert!(server.send(b"x", &older_snapshot));
    assert!(wait_until(|| count(&newer_seen, NotificationKind::Received) == 1));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(count(&older_seen, NotificationKind::Received), 0);
}

#[test]
fn server_restart_keeps_serving_on_the_same_port() {
    let network = LoopbackNetwork::new();
    let (server, server_seen) = server(&network, 7210, 4);
    let (client, _client_seen) = connected_client(&network, 7210);
    assert!(wait_until(|| server.client_count() == 1));

    server.stop_listening().unwrap();
    assert_eq!(server.loop_state(), LoopState::Stopped);
    assert!(client.send(b"while stopped"));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(count(&server_seen, NotificationKind::Received), 0);

    server.start_listening().unwrap();
    assert!(wait_until(|| count(&server_seen, NotificationKind::Received) == 1));
    assert_eq!(server.client_count(), 1);
    assert_eq!(server.loop_stats().runs_started, 2);
}
