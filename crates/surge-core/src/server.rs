//! Admission control, the pending-connection set, client-ID allocation,
//! broadcast helpers, and the relay filter.

use crate::connection::{parse_ack_body, parse_reliable_body, Connection, ConnectionState, ReceiveOutcome};
use crate::error::SurgeError;
use crate::events::EventSlot;
use crate::header::{DisconnectReason, MessageHeader, RejectReason};
use crate::message::MessagePool;
use crate::peer::Peer;
use crate::time::{DelayedAction, Millis};
use crate::transport::{Datagram, Transport};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use surge_binary::{BinaryReader, BinaryWriter};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy)]
pub struct ClientConnectedEvent {
    pub client_id: u16,
}

#[derive(Debug, Clone)]
pub struct MessageReceivedEvent {
    pub client_id: u16,
    pub message_id: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientDisconnectedEvent {
    pub client_id: u16,
    pub reason: DisconnectReason,
}

type ConnectHandler = Box<dyn FnMut(&mut Server, SocketAddr, Bytes) + Send>;
type MessageHandler = Box<dyn FnMut(&mut Server, u16, Bytes) + Send>;

/// Admission-control and fan-out state for one listening endpoint.
pub struct Server {
    peer: Peer,
    transport: Arc<dyn Transport>,
    config: ServerConfig,

    clients: HashMap<u16, Connection>,
    /// Pending connections, keyed by endpoint: the id is not assigned yet.
    pending: HashMap<SocketAddr, Connection>,
    available_ids: VecDeque<u16>,

    relay_filter: Option<HashSet<u16>>,
    handle_connection: Option<ConnectHandler>,
    message_handlers: HashMap<u16, MessageHandler>,

    pub on_client_connected: EventSlot<ClientConnectedEvent>,
    pub on_message_received: EventSlot<MessageReceivedEvent>,
    pub on_client_disconnected: EventSlot<ClientDisconnectedEvent>,
}

impl Server {
    pub fn new(transport: Arc<dyn Transport>, inbound_rx: crate::transport::InboundRx, config: ServerConfig) -> Self {
        let available_ids = (1..=config.max_client_count).collect();
        info!(max_client_count = config.max_client_count, "server starting");
        Self {
            peer: Peer::new(inbound_rx),
            transport,
            config,
            clients: HashMap::new(),
            pending: HashMap::new(),
            available_ids,
            relay_filter: None,
            handle_connection: None,
            message_handlers: HashMap::new(),
            on_client_connected: EventSlot::new(),
            on_message_received: EventSlot::new(),
            on_client_disconnected: EventSlot::new(),
        }
    }

    pub fn set_relay_filter(&mut self, message_ids: HashSet<u16>) {
        self.relay_filter = Some(message_ids);
    }

    /// If unset, every `Connect` is accepted automatically (SPEC §4.4).
    pub fn on_connect_attempt<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Server, SocketAddr, Bytes) + Send + 'static,
    {
        self.handle_connection = Some(Box::new(handler));
    }

    pub fn register_message_handler<F>(&mut self, message_id: u16, handler: F)
    where
        F: FnMut(&mut Server, u16, Bytes) + Send + 'static,
    {
        self.message_handlers.insert(message_id, Box::new(handler));
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_client(&self, id: u16) -> bool {
        self.clients.contains_key(&id)
    }

    fn next_available_id(&mut self) -> Option<u16> {
        self.available_ids.pop_front()
    }

    fn release_id(&mut self, id: u16) {
        self.available_ids.push_back(id);
    }

    /// `accept(c)` (SPEC §4.4): binds the smallest available id, transitions
    /// to `Connected`, sends `Welcome`, emits `clientConnected`.
    pub fn accept(&mut self, endpoint: SocketAddr) {
        let Some(mut conn) = self.pending.remove(&endpoint) else {
            warn!(%endpoint, "accept called on a non-pending connection, ignoring");
            return;
        };

        if self.clients.len() >= self.config.max_client_count as usize {
            self.reject_connection(conn, RejectReason::ServerFull, None);
            return;
        }

        let Some(id) = self.next_available_id() else {
            warn!("no available client ids despite admission guard passing");
            self.reject_connection(conn, RejectReason::ServerFull, None);
            return;
        };

        let now = self.peer.now();
        conn.id = id;
        conn.state = ConnectionState::Connected;
        conn.touch(now);

        let mut welcome = vec![MessageHeader::Welcome.to_byte()];
        welcome.write_u16(id).expect("Vec<u8> write is infallible");

        self.peer
            .schedule(now + conn.heartbeat_interval_ms, DelayedAction::Heartbeat(endpoint));

        debug!(client_id = id, %endpoint, "client accepted");
        self.clients.insert(id, conn);
        self.send_or_disconnect(id, &welcome);
        if self.clients.contains_key(&id) {
            self.on_client_connected.fire(&ClientConnectedEvent { client_id: id });
        }
    }

    /// Sends `frame` to the client at `id`; on transport failure, tears the
    /// connection down and surfaces `Disconnected(TransportError)` (SPEC §7)
    /// instead of the frame's intended effect.
    fn send_or_disconnect(&mut self, id: u16, frame: &[u8]) {
        let Some(remote) = self.clients.get(&id).map(|c| c.remote) else {
            return;
        };
        if let Err(err) = self.transport.send_to(frame, remote) {
            warn!(client_id = id, %remote, error = %SurgeError::Io(err), "transport send failed, disconnecting client");
            if self.clients.remove(&id).is_some() {
                self.release_id(id);
                self.broadcast_client_left(id);
                self.on_client_disconnected.fire(&ClientDisconnectedEvent {
                    client_id: id,
                    reason: DisconnectReason::TransportError,
                });
            }
        }
    }

    /// `reject(c, reason, payload?)` (SPEC §4.4).
    pub fn reject(&mut self, endpoint: SocketAddr, reason: RejectReason, payload: Option<&[u8]>) {
        let Some(conn) = self.pending.remove(&endpoint) else {
            warn!(%endpoint, "reject called on a non-pending connection, ignoring");
            return;
        };
        self.reject_connection(conn, reason, payload);
    }

    fn reject_connection(&mut self, conn: Connection, reason: RejectReason, payload: Option<&[u8]>) {
        let endpoint = conn.remote;
        if reason == RejectReason::AlreadyConnected {
            // Information-leak hardening: never confirm an address is already bound.
            return;
        }

        let mut frame = vec![MessageHeader::Reject.to_byte(), reason.to_byte()];
        if reason == RejectReason::Custom {
            if let Some(payload) = payload {
                frame.extend_from_slice(payload);
            }
        }
        for _ in 0..3 {
            if let Err(err) = self.transport.send_to(&frame, endpoint) {
                warn!(%endpoint, error = %SurgeError::Io(err), "failed to send Reject");
                break;
            }
        }

        let now = self.peer.now();
        self.peer.schedule(
            now + self.config.peer.connect_timeout_ms,
            DelayedAction::CloseRejectedConnection(endpoint),
        );
        debug!(%endpoint, ?reason, "connection rejected");
    }

    /// `disconnectClient(id, msg?)` (SPEC §6/§8 S5).
    pub fn disconnect_client(&mut self, id: u16, payload: Option<&[u8]>) {
        let Some(mut conn) = self.clients.remove(&id) else {
            warn!(client_id = id, "disconnect requested for unknown client, ignoring");
            return;
        };
        let mut frame = conn.disconnect(DisconnectReason::Kicked);
        if let Some(payload) = payload {
            frame.extend_from_slice(payload);
        }
        if let Err(err) = self.transport.send_to(&frame, conn.remote) {
            warn!(client_id = id, error = %SurgeError::Io(err), "failed to send kick frame");
        }
        self.release_id(id);
        self.broadcast_client_left(id);
        self.on_client_disconnected.fire(&ClientDisconnectedEvent {
            client_id: id,
            reason: DisconnectReason::Kicked,
        });
    }

    fn broadcast_client_left(&mut self, id: u16) {
        let mut frame = vec![MessageHeader::ClientDisconnected.to_byte()];
        frame.write_u16(id).expect("Vec<u8> write is infallible");
        self.send_raw_to_all(&frame, None);
    }

    fn send_raw_to_all(&mut self, frame: &[u8], except: Option<u16>) {
        let targets: Vec<u16> = self
            .clients
            .keys()
            .copied()
            .filter(|&id| Some(id) != except)
            .collect();
        for id in targets {
            self.send_or_disconnect(id, frame);
        }
    }

    /// `sendToAll(msg, except?)`: sends an unreliable application payload
    /// to every connected client.
    pub fn send_to_all_unreliable(&mut self, payload: &[u8], except: Option<u16>) {
        let frame = Connection::frame_unreliable(payload);
        self.send_raw_to_all(&frame, except);
    }

    pub fn send_to_all_reliable(&mut self, payload: &[u8], except: Option<u16>) {
        let now = self.peer.now();
        let ids: Vec<u16> = self.clients.keys().copied().collect();
        for id in ids {
            if Some(id) == except {
                continue;
            }
            let Some(frame) = self.clients.get_mut(&id).map(|conn| conn.send_reliable(now, payload)) else {
                continue;
            };
            self.send_or_disconnect(id, &frame);
        }
    }

    pub fn send_unreliable(&mut self, id: u16, payload: &[u8]) {
        if !self.clients.contains_key(&id) {
            warn!(client_id = id, "send to unknown client, dropping");
            return;
        }
        let frame = Connection::frame_unreliable(payload);
        self.send_or_disconnect(id, &frame);
    }

    pub fn send_reliable(&mut self, id: u16, payload: &[u8]) {
        let now = self.peer.now();
        let Some(conn) = self.clients.get_mut(&id) else {
            warn!(client_id = id, "send to unknown client, dropping");
            return;
        };
        let frame = conn.send_reliable(now, payload);
        self.send_or_disconnect(id, &frame);
    }

    pub fn tick(&mut self) {
        let now = self.peer.now();
        let datagrams = self.peer.drain_inbound();
        for datagram in datagrams {
            self.handle_datagram(now, datagram);
        }

        for action in self.peer.due_events(now) {
            match action {
                DelayedAction::Heartbeat(addr) => self.fire_heartbeat(now, addr),
                DelayedAction::CloseRejectedConnection(_addr) => {
                    // Grace period elapsed; the connection was never tracked
                    // past `pending` removal, so there is nothing left to drop.
                }
                DelayedAction::ClosePendingConnection(addr) => {
                    if self.pending.remove(&addr).is_some() {
                        debug!(%addr, "pending connection timed out awaiting accept/reject, garbage collected");
                    }
                }
            }
        }

        self.retransmit_and_timeout(now);
    }

    fn fire_heartbeat(&mut self, now: Millis, addr: SocketAddr) {
        let Some(id) = self.id_for_endpoint(addr) else {
            return;
        };
        let Some(conn) = self.clients.get_mut(&id) else {
            return;
        };
        let frame = conn.maybe_heartbeat(now);
        if let Some(frame) = frame {
            self.send_or_disconnect(id, &frame);
        }
        if let Some(conn) = self.clients.get(&id) {
            self.peer
                .schedule(now + conn.heartbeat_interval_ms, DelayedAction::Heartbeat(addr));
        }
    }

    fn id_for_endpoint(&self, addr: SocketAddr) -> Option<u16> {
        self.clients
            .iter()
            .find(|(_, conn)| conn.remote == addr)
            .map(|(&id, _)| id)
    }

    fn retransmit_and_timeout(&mut self, now: Millis) {
        let mut timed_out = Vec::new();
        for (&id, conn) in self.clients.iter_mut() {
            for frame in conn.retransmission_scan(now) {
                // Borrow split: collect frames first, send after the loop
                // below to avoid re-borrowing `self.transport` mutably twice.
                timed_out.push((id, Some(frame)));
            }
            if conn.is_timed_out(now) {
                timed_out.push((id, None));
            }
        }

        for (id, frame) in timed_out {
            match frame {
                Some(frame) => self.send_or_disconnect(id, &frame),
                None => self.handle_timeout(id),
            }
        }
    }

    fn handle_timeout(&mut self, id: u16) {
        let Some(_conn) = self.clients.remove(&id) else {
            return;
        };
        self.release_id(id);
        self.broadcast_client_left(id);
        warn!(client_id = id, "client timed out");
        self.on_client_disconnected.fire(&ClientDisconnectedEvent {
            client_id: id,
            reason: DisconnectReason::TimedOut,
        });
    }

    fn handle_datagram(&mut self, now: Millis, datagram: Datagram) {
        if datagram.bytes.is_empty() {
            return;
        }
        let header_byte = datagram.bytes[0];
        let body = datagram.bytes.slice(1..);
        let Ok(kind) = MessageHeader::from_byte(header_byte) else {
            warn!(header_byte, from = %datagram.from, "unknown message header, dropping");
            return;
        };

        if kind == MessageHeader::Connect {
            self.handle_connect(now, datagram.from, body);
            return;
        }

        let Some(id) = self.id_for_endpoint(datagram.from) else {
            trace!(from = %datagram.from, "datagram from unknown endpoint, dropping");
            return;
        };

        if let Some(conn) = self.clients.get_mut(&id) {
            conn.touch(now);
        }

        match kind {
            MessageHeader::Unreliable => self.handle_user_payload(id, body),
            MessageHeader::Reliable => {
                let Ok((seq, payload)) = parse_reliable_body(body) else {
                    warn!(client_id = id, "malformed Reliable frame, dropping");
                    return;
                };
                let (outcome, ack) = {
                    let conn = self.clients.get_mut(&id).unwrap();
                    conn.handle_reliable(seq)
                };
                self.send_or_disconnect(id, &ack);
                if outcome == ReceiveOutcome::Deliver {
                    self.handle_user_payload(id, payload);
                }
            }
            MessageHeader::Ack | MessageHeader::AckExtra => {
                if let Ok((acked_seq, bitfield)) = parse_ack_body(body) {
                    if let Some(conn) = self.clients.get_mut(&id) {
                        conn.handle_ack(now, acked_seq, bitfield);
                    }
                }
            }
            MessageHeader::Heartbeat => {
                let mut reader = body;
                if let Ok(timestamp) = reader.read_i64() {
                    let echo = self
                        .clients
                        .get_mut(&id)
                        .and_then(|conn| conn.handle_heartbeat(now, timestamp));
                    if let Some(echo) = echo {
                        self.send_or_disconnect(id, &echo);
                    }
                }
            }
            MessageHeader::Disconnect => {
                self.clients.remove(&id);
                self.release_id(id);
                self.broadcast_client_left(id);
                self.on_client_disconnected.fire(&ClientDisconnectedEvent {
                    client_id: id,
                    reason: DisconnectReason::Disconnected,
                });
            }
            _ => {
                trace!(client_id = id, ?kind, "unexpected frame kind from client, dropping");
            }
        }
    }

    fn handle_connect(&mut self, now: Millis, endpoint: SocketAddr, payload: Bytes) {
        if self.id_for_endpoint(endpoint).is_some() || self.pending.contains_key(&endpoint) {
            trace!(%endpoint, "duplicate Connect, re-acking without new state");
            let echo = [MessageHeader::Connect.to_byte()];
            if let Err(err) = self.transport.send_to(&echo, endpoint) {
                warn!(%endpoint, error = %SurgeError::Io(err), "failed to re-ack duplicate Connect");
            }
            return;
        }

        let conn = Connection::new(
            endpoint,
            ConnectionState::Pending,
            now,
            self.config.peer.timeout_ms,
            self.config.peer.heartbeat_interval_ms,
        );
        self.pending.insert(endpoint, conn);
        self.peer.schedule(
            now + self.config.peer.connect_timeout_ms,
            DelayedAction::ClosePendingConnection(endpoint),
        );

        let echo = [MessageHeader::Connect.to_byte()];
        if let Err(err) = self.transport.send_to(&echo, endpoint) {
            warn!(%endpoint, error = %SurgeError::Io(err), "failed to send Connect echo");
        }

        if let Some(mut handler) = self.handle_connection.take() {
            handler(self, endpoint, payload);
            self.handle_connection = Some(handler);
        } else {
            self.accept(endpoint);
        }
    }

    fn handle_user_payload(&mut self, client_id: u16, mut payload: Bytes) {
        let Ok(message_id) = payload.read_u16() else {
            warn!(client_id, "user payload missing message id, dropping");
            return;
        };
        let body = Bytes::from(payload.read_remaining());

        if let Some(filter) = &self.relay_filter {
            if filter.contains(&message_id) {
                let mut frame = Vec::with_capacity(3 + body.len());
                frame.push(MessageHeader::Unreliable.to_byte());
                frame
                    .write_u16(message_id)
                    .expect("Vec<u8> write is infallible");
                frame.extend_from_slice(&body);
                self.send_raw_to_all(&frame, Some(client_id));
                return;
            }
        }

        if self.config.use_message_handlers && self.message_handlers.contains_key(&message_id) {
            if let Some(mut handler) = self.message_handlers.remove(&message_id) {
                handler(self, client_id, body);
                self.message_handlers.insert(message_id, handler);
            }
            return;
        }

        self.on_message_received.fire(&MessageReceivedEvent {
            client_id,
            message_id,
            payload: body,
        });
    }

    pub fn pool_mut(&mut self) -> &mut MessagePool {
        self.peer.pool_mut()
    }
}
