//! Engine configuration. Plain structs with `Default` impls — the engine
//! itself never touches the filesystem; the embedding application (see the
//! `surge` demo binary) is responsible for loading values from a config
//! file and constructing these.

use crate::connection::{DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_TIMEOUT_MS};
use crate::time::Millis;

/// Shared client/server peer settings (SPEC §6 Configuration).
#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    /// Inactivity threshold before a connection is declared dead.
    pub timeout_ms: Millis,
    pub heartbeat_interval_ms: Millis,
    /// Client-side wait for `Welcome`; server-side grace for rejected
    /// connections to drain their final retransmits.
    pub connect_timeout_ms: Millis,
    /// Transport hint; not enforced by the engine itself.
    pub socket_buffer_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            connect_timeout_ms: 10_000,
            socket_buffer_size: 1024 * 1024,
        }
    }
}

/// Server-only admission settings layered on top of `PeerConfig`.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub peer: PeerConfig,
    /// Bounds the `availableIds` range to `[1, max_client_count]`.
    pub max_client_count: u16,
    /// If false, only the `messageReceived` event fires; the per-id
    /// handler map is never consulted.
    pub use_message_handlers: bool,
}

impl ServerConfig {
    pub fn new(max_client_count: u16) -> Self {
        Self {
            peer: PeerConfig::default(),
            max_client_count,
            use_message_handlers: true,
        }
    }
}
