//! Loopback Echo Example
//!
//! A server that echoes every packet back to its sender, and a client that sends
//! a few messages and prints the replies, all over the in-process loopback network.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use peerlink_harness::LoopbackNetwork;
use peerlink_runtime::{Client, ClientConfig, Notification, Server, ServerConfig};

const PORT: u16 = 7777;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    let _ = tracing_subscriber::fmt::try_init();

    println!("peerlink - Loopback Echo Example");
    println!("================================");

    let network = LoopbackNetwork::new();

    // Echo server
    let server = Arc::new(Server::with_config(&network, ServerConfig::new(PORT, 8))?);
    {
        let echo = Arc::downgrade(&server);
        server.observers().on_received(move |notification| {
            if let (Some(server), Notification::Received(peer, payload)) =
                (echo.upgrade(), notification)
            {
                server.send(payload, peer);
            }
        });
    }
    server.observers().on_connected(|notification| {
        println!("server: client connected from {}", notification.peer());
    });
    server.start_listening()?;

    // Client
    let client = Client::with_config(&network, ClientConfig::default())?;
    let (replies, inbox) = mpsc::channel();
    client.observers().on_received(move |notification| {
        if let Some(payload) = notification.payload() {
            let _ = replies.send(payload.to_vec());
        }
    });
    client.start_listening()?;
    client.connect("127.0.0.1", PORT)?;

    for message in ["hello", "from", "peerlink"] {
        if !client.send(message.as_bytes()) {
            println!("client: send of {:?} was rejected", message);
            continue;
        }
        let reply = inbox.recv_timeout(Duration::from_secs(2))?;
        println!("client: echoed {:?}", String::from_utf8_lossy(&reply));
    }

    println!("\nserver clients: {:?}", server.connected_clients());
    println!("server loop stats: {:?}", server.loop_stats());

    client.disconnect(0);
    std::thread::sleep(Duration::from_millis(20));
    client.stop_listening()?;
    server.stop_listening()?;

    println!("\nDone.");
    Ok(())
}
