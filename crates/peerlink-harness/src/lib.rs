#![doc = "peerlink Harness\n\nIn-process transports used to exercise the session loop without sockets:\na loopback network with real connect/send/disconnect semantics, and a scripted\nfake that records exactly how it was polled."]

pub mod loopback;
pub mod scripted;

pub use loopback::{LoopbackConfig, LoopbackHost, LoopbackNetwork, LoopbackPacket, LoopbackPeer};
pub use scripted::{ScriptCall, ScriptedPacket, ScriptedTransport};
