//! Drives a single `Connection`: initiates `connect()`, handles the
//! welcome/reject handshake, and surfaces lifecycle events.

use crate::connection::{parse_ack_body, parse_reliable_body, Connection, ConnectionState, ReceiveOutcome};
use crate::error::SurgeError;
use crate::events::EventSlot;
use crate::header::{DisconnectReason, MessageHeader, RejectReason};
use crate::message::{Message, MessagePool};
use crate::peer::Peer;
use crate::time::{DelayedAction, Millis};
use crate::transport::{Datagram, Transport};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use surge_binary::BinaryReader;
use tracing::{debug, trace, warn};

use crate::config::PeerConfig;

#[derive(Debug, Clone)]
pub struct ConnectedEvent {
    pub assigned_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Rejected(RejectReason),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ConnectionFailedEvent {
    pub reason: ConnectFailure,
}

#[derive(Debug, Clone, Copy)]
pub struct DisconnectedEvent {
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone)]
pub struct DataReceivedEvent {
    pub payload: Bytes,
}

/// How many times `connect()` resends `Connect` before giving up is not
/// fixed by count; it resends at the retransmission cadence until
/// `connectTimeoutMs` elapses (SPEC §4.3).
const CONNECT_RETRY_INTERVAL_MS: Millis = 500;

pub struct Client {
    peer: Peer,
    transport: Arc<dyn Transport>,
    config: PeerConfig,

    server_addr: Option<SocketAddr>,
    connection: Option<Connection>,
    connect_started_at: Millis,
    last_connect_sent: Millis,
    assigned_id: u16,

    pub on_connected: EventSlot<ConnectedEvent>,
    pub on_connection_failed: EventSlot<ConnectionFailedEvent>,
    pub on_disconnected: EventSlot<DisconnectedEvent>,
    pub on_data_received: EventSlot<DataReceivedEvent>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, inbound_rx: crate::transport::InboundRx, config: PeerConfig) -> Self {
        Self {
            peer: Peer::new(inbound_rx),
            transport,
            config,
            server_addr: None,
            connection: None,
            connect_started_at: 0,
            last_connect_sent: 0,
            assigned_id: 0,
            on_connected: EventSlot::new(),
            on_connection_failed: EventSlot::new(),
            on_disconnected: EventSlot::new(),
            on_data_received: EventSlot::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(ConnectionState::NotConnected)
    }

    pub fn assigned_id(&self) -> u16 {
        self.assigned_id
    }

    /// Begins the handshake. `tick()` must be called afterward to drive it.
    pub fn connect(&mut self, server_addr: SocketAddr) {
        let now = self.peer.now();
        self.server_addr = Some(server_addr);
        self.connection = Some(Connection::new(
            server_addr,
            ConnectionState::Connecting,
            now,
            self.config.timeout_ms,
            self.config.heartbeat_interval_ms,
        ));
        self.connect_started_at = now;
        self.send_connect_frame(server_addr);
        self.last_connect_sent = now;
    }

    fn send_connect_frame(&self, server_addr: SocketAddr) {
        let frame = [MessageHeader::Connect.to_byte()];
        if let Err(err) = self.transport.send_to(&frame, server_addr) {
            warn!(%server_addr, error = %SurgeError::Io(err), "failed to send Connect");
        }
    }

    /// Sends `frame` to `remote`; on transport failure, tears down the
    /// connection and surfaces `Disconnected(TransportError)` (SPEC §7).
    fn send_frame_or_disconnect(&mut self, remote: SocketAddr, frame: &[u8]) {
        if let Err(err) = self.transport.send_to(frame, remote) {
            warn!(%remote, error = %SurgeError::Io(err), "transport send failed, disconnecting");
            self.connection = None;
            self.on_disconnected.fire(&DisconnectedEvent {
                reason: DisconnectReason::TransportError,
            });
        }
    }

    /// Synchronous, best-effort: a plain `Disconnect` frame, no reliability.
    pub fn disconnect(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if conn.state != ConnectionState::Connected && conn.state != ConnectionState::Connecting {
            return;
        }
        let remote = conn.remote;
        let frame = conn.disconnect(DisconnectReason::Disconnected);
        if let Err(err) = self.transport.send_to(&frame, remote) {
            warn!(%remote, error = %SurgeError::Io(err), "failed to send Disconnect");
        }
        self.connection = None;
    }

    pub fn send_unreliable(&mut self, payload: &[u8]) {
        let Some(conn) = &self.connection else { return };
        if conn.state != ConnectionState::Connected {
            warn!("send_unreliable called while not connected, dropping");
            return;
        }
        let remote = conn.remote;
        let frame = Connection::frame_unreliable(payload);
        self.send_frame_or_disconnect(remote, &frame);
    }

    pub fn send_reliable(&mut self, now_override: Option<Millis>, payload: &[u8]) {
        let now = now_override.unwrap_or_else(|| self.peer.now());
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if conn.state != ConnectionState::Connected {
            warn!("send_reliable called while not connected, dropping");
            return;
        }
        let remote = conn.remote;
        let frame = conn.send_reliable(now, payload);
        self.send_frame_or_disconnect(remote, &frame);
    }

    /// Drains inbound datagrams, advances the handshake or established
    /// connection, retransmits, and fires due heartbeats. Non-blocking.
    pub fn tick(&mut self) {
        let now = self.peer.now();
        let datagrams = self.peer.drain_inbound();
        for datagram in datagrams {
            self.handle_datagram(now, datagram);
        }

        self.drive_handshake(now);

        for action in self.peer.due_events(now) {
            if let DelayedAction::Heartbeat(addr) = action {
                self.fire_heartbeat(now, addr);
            }
        }

        if let Some(conn) = self.connection.as_mut() {
            if conn.state == ConnectionState::Connected {
                let remote = conn.remote;
                let frames = conn.retransmission_scan(now);
                let timed_out = conn.is_timed_out(now);
                let mut transport_failed = false;
                for frame in frames {
                    if let Err(err) = self.transport.send_to(&frame, remote) {
                        warn!(%remote, error = %SurgeError::Io(err), "transport send failed during retransmit");
                        transport_failed = true;
                        break;
                    }
                }
                if transport_failed {
                    self.fail_connected(DisconnectReason::TransportError);
                } else if timed_out {
                    self.fail_connected(DisconnectReason::TimedOut);
                }
            }
        }
    }

    fn drive_handshake(&mut self, now: Millis) {
        let Some(conn) = &self.connection else { return };
        if conn.state != ConnectionState::Connecting {
            return;
        }
        if now - self.connect_started_at > self.config.connect_timeout_ms {
            self.connection = None;
            self.on_connection_failed.fire(&ConnectionFailedEvent {
                reason: ConnectFailure::TimedOut,
            });
            return;
        }
        if now - self.last_connect_sent >= CONNECT_RETRY_INTERVAL_MS {
            let server_addr = conn.remote;
            self.send_connect_frame(server_addr);
            self.last_connect_sent = now;
        }
    }

    fn fire_heartbeat(&mut self, now: Millis, addr: SocketAddr) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if conn.remote != addr || conn.state != ConnectionState::Connected {
            return;
        }
        let frame = conn.maybe_heartbeat(now);
        if let Some(frame) = frame {
            self.send_frame_or_disconnect(addr, &frame);
        }
        if self.connection.is_some() {
            self.peer
                .schedule(now + self.config.heartbeat_interval_ms, DelayedAction::Heartbeat(addr));
        }
    }

    fn fail_connected(&mut self, reason: DisconnectReason) {
        self.connection = None;
        self.on_disconnected.fire(&DisconnectedEvent { reason });
    }

    fn handle_datagram(&mut self, now: Millis, datagram: Datagram) {
        let Some(server_addr) = self.server_addr else {
            return;
        };
        if datagram.from != server_addr {
            trace!(from = %datagram.from, "dropping datagram from unknown endpoint");
            return;
        }

        let mut body = datagram.bytes;
        if body.is_empty() {
            return;
        }
        let header_byte = body[0];
        body = body.slice(1..);
        let Ok(kind) = MessageHeader::from_byte(header_byte) else {
            warn!(header_byte, "unknown message header, dropping");
            return;
        };

        match kind {
            MessageHeader::Welcome => self.handle_welcome(now, body),
            MessageHeader::Reject => self.handle_reject(body),
            _ => self.handle_established(now, kind, body),
        }
    }

    fn handle_welcome(&mut self, now: Millis, mut body: Bytes) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if conn.state != ConnectionState::Connecting {
            return;
        }
        let Ok(assigned_id) = body.read_u16() else {
            warn!("malformed Welcome frame, dropping");
            return;
        };
        conn.touch(now);
        conn.state = ConnectionState::Connected;
        self.assigned_id = assigned_id;
        self.peer.schedule(
            now + self.config.heartbeat_interval_ms,
            DelayedAction::Heartbeat(conn.remote),
        );
        debug!(assigned_id, "client connected");
        self.on_connected.fire(&ConnectedEvent { assigned_id });
    }

    fn handle_reject(&mut self, mut body: Bytes) {
        if self
            .connection
            .as_ref()
            .map(|c| c.state != ConnectionState::Connecting)
            .unwrap_or(true)
        {
            return;
        }
        let reason = body
            .read_u8()
            .ok()
            .and_then(|b| RejectReason::from_byte(b).ok())
            .unwrap_or(RejectReason::Rejected);
        self.connection = None;
        self.on_connection_failed.fire(&ConnectionFailedEvent {
            reason: ConnectFailure::Rejected(reason),
        });
    }

    fn handle_established(&mut self, now: Millis, kind: MessageHeader, body: Bytes) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if conn.state != ConnectionState::Connected {
            return;
        }
        conn.touch(now);

        match kind {
            MessageHeader::Unreliable => {
                self.on_data_received.fire(&DataReceivedEvent { payload: body });
            }
            MessageHeader::Reliable => {
                let Ok((seq, payload)) = parse_reliable_body(body) else {
                    warn!("malformed Reliable frame, dropping");
                    return;
                };
                let remote = conn.remote;
                let (outcome, ack) = conn.handle_reliable(seq);
                self.send_frame_or_disconnect(remote, &ack);
                if outcome == ReceiveOutcome::Deliver {
                    self.on_data_received.fire(&DataReceivedEvent { payload });
                }
            }
            MessageHeader::Ack | MessageHeader::AckExtra => {
                if let Ok((acked_seq, bitfield)) = parse_ack_body(body) {
                    conn.handle_ack(now, acked_seq, bitfield);
                }
            }
            MessageHeader::Heartbeat => {
                let mut reader = body;
                if let Ok(timestamp) = reader.read_i64() {
                    let remote = conn.remote;
                    if let Some(echo) = conn.handle_heartbeat(now, timestamp) {
                        self.send_frame_or_disconnect(remote, &echo);
                    }
                }
            }
            MessageHeader::Disconnect => {
                let mut reader = body;
                let reason = reader
                    .read_u8()
                    .ok()
                    .and_then(|b| DisconnectReason::from_byte(b).ok())
                    .unwrap_or(DisconnectReason::Disconnected);
                self.connection = None;
                self.on_disconnected.fire(&DisconnectedEvent { reason });
            }
            MessageHeader::ClientConnected | MessageHeader::ClientDisconnected => {
                // Informational broadcast frames; no client-side state to update.
            }
            MessageHeader::Connect | MessageHeader::Reject | MessageHeader::Welcome => {
                // Handshake frames handled earlier in `handle_datagram`.
            }
        }
    }

    pub fn pool_mut(&mut self) -> &mut MessagePool {
        self.peer.pool_mut()
    }

    pub fn acquire_message(&mut self, kind: MessageHeader) -> Message {
        self.peer.pool_mut().acquire(kind)
    }
}
