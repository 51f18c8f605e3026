use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the peer protocol engine's setup and send paths.
///
/// Per-datagram protocol violations (malformed frames, unknown header
/// bytes, duplicate handshakes) are *not* represented here: they are
/// logged and swallowed inside `Peer::tick`, never propagated out of it,
/// so a misbehaving remote peer cannot abort the local one.
#[derive(Error, Debug)]
pub enum SurgeError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary codec error: {0}")]
    Binary(#[from] surge_binary::BinaryError),

    #[error("no connection found for endpoint {0}")]
    NoSuchConnection(SocketAddr),

    #[error("no client with id {0}")]
    NoSuchClient(u16),

    #[error("connect attempt to {0} timed out")]
    ConnectTimedOut(SocketAddr),

    #[error("connect attempt to {0} was rejected: {1:?}")]
    ConnectRejected(SocketAddr, crate::header::RejectReason),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("no available client ids (server admission guard should have prevented this)")]
    NoAvailableClientIds,
}

pub type Result<T> = std::result::Result<T, SurgeError>;
