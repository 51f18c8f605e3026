//! The transport-agnostic peer protocol engine: connect/welcome/reject/
//! disconnect handshake, reliable delivery with a sliding receive window
//! and retransmission, per-connection heartbeat and timeout, and
//! server-side admission control.
//!
//! Everything outside this crate is a collaborator: the raw socket I/O
//! (`Transport`), the payload buffer (`Message`), and application-level
//! message-handler registration are all modeled here, but logging,
//! higher-level game/RPC abstractions, and config-file loading live in the
//! embedding application.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod header;
pub mod message;
pub mod peer;
pub mod server;
pub mod time;
pub mod transport;

pub use client::Client;
pub use config::{PeerConfig, ServerConfig};
pub use connection::{Connection, ConnectionState, ReceiveOutcome};
pub use error::{Result, SurgeError};
pub use header::{DisconnectReason, MessageHeader, RejectReason};
pub use message::{Message, MessagePool};
pub use server::Server;
pub use transport::{Datagram, HubTransport, LoopbackHub, LoopbackTransport, Transport as TransportTrait, UdpTransport};
