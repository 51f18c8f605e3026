//! Per-peer state machine: sequence counters, ack bitfield, retransmission
//! table, timeout clock, and the connect/welcome/reject/disconnect phase.
//!
//! `Connection` never touches a `Transport` directly — it is handed inbound
//! frame bytes and returns outbound frame bytes for the caller (`Client` or
//! `Server`, via `Peer`) to hand to the transport. That keeps the state
//! machine testable without any socket at all.

use crate::header::{DisconnectReason, MessageHeader};
use crate::time::Millis;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use surge_binary::{BinaryReader, BinaryWriter};
use tracing::trace;

pub const DEFAULT_TIMEOUT_MS: Millis = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: Millis = 1000;
const MIN_RETRANSMIT_TIMEOUT_MS: Millis = 50;
const RTT_ALPHA: f64 = 1.0 / 8.0;
const RTT_BETA: f64 = 1.0 / 4.0;
const ACK_WINDOW: u16 = 16;

/// Connection lifecycle phase (SPEC §4.1). `Pending` only ever appears on
/// the server side, between receipt of `Connect` and an application
/// `accept`/`reject` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Pending,
    Connected,
    Disconnected,
}

struct PendingAck {
    bytes: Bytes,
    first_sent_at: Millis,
    last_sent_at: Millis,
    retry_count: u32,
}

/// Outcome of processing one inbound reliable frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Never seen before; deliver to the application.
    Deliver,
    /// Already seen (wire retransmit of a frame already delivered); drop
    /// the payload but still ack it.
    Duplicate,
    /// More than 16 sequences behind `lastReceivedSeq`; drop and ack.
    TooOld,
}

/// One endpoint's connection state: handshake phase, the reliable send
/// and receive windows, RTT estimation, and liveness tracking.
pub struct Connection {
    pub remote: SocketAddr,
    pub id: u16,
    pub state: ConnectionState,

    next_reliable_seq: u16,
    last_received_seq: u16,
    received_any_reliable: bool,
    receive_ack_bitfield: u16,
    pending_acks: BTreeMap<u16, PendingAck>,

    pub last_heard_from: Millis,
    last_heartbeat_sent: Millis,
    pending_heartbeat_ts: Option<Millis>,
    smoothed_rtt: f64,
    rtt_variance: f64,

    pub timeout_ms: Millis,
    pub heartbeat_interval_ms: Millis,
}

impl Connection {
    pub fn new(
        remote: SocketAddr,
        state: ConnectionState,
        now: Millis,
        timeout_ms: Millis,
        heartbeat_interval_ms: Millis,
    ) -> Self {
        Self {
            remote,
            id: 0,
            state,
            next_reliable_seq: 0,
            last_received_seq: 0,
            received_any_reliable: false,
            receive_ack_bitfield: 0,
            pending_acks: BTreeMap::new(),
            last_heard_from: now,
            last_heartbeat_sent: now,
            pending_heartbeat_ts: None,
            smoothed_rtt: 0.0,
            rtt_variance: 0.0,
            timeout_ms,
            heartbeat_interval_ms,
        }
    }

    /// Marks this connection as having heard from its remote endpoint,
    /// whatever the datagram kind. Resets the timeout clock.
    pub fn touch(&mut self, now: Millis) {
        self.last_heard_from = now;
    }

    pub fn is_timed_out(&self, now: Millis) -> bool {
        now - self.last_heard_from > self.timeout_ms
    }

    fn retransmit_timeout(&self) -> Millis {
        let rto = self.smoothed_rtt + 4.0 * self.rtt_variance;
        (rto as Millis).max(MIN_RETRANSMIT_TIMEOUT_MS)
    }

    fn sample_rtt(&mut self, rtt_ms: Millis) {
        let rtt = rtt_ms as f64;
        if self.smoothed_rtt == 0.0 && self.rtt_variance == 0.0 {
            self.smoothed_rtt = rtt;
            self.rtt_variance = rtt / 2.0;
        } else {
            self.rtt_variance = (1.0 - RTT_BETA) * self.rtt_variance + RTT_BETA * (self.smoothed_rtt - rtt).abs();
            self.smoothed_rtt = (1.0 - RTT_ALPHA) * self.smoothed_rtt + RTT_ALPHA * rtt;
        }
    }

    /// Frames an unreliable payload. Stateless; never touches pendingAcks.
    pub fn frame_unreliable(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(MessageHeader::Unreliable.to_byte());
        frame.extend_from_slice(payload);
        frame
    }

    /// Assigns the next sequence number, frames the reliable payload, and
    /// records a `pendingAcks` entry for the retransmission scan.
    pub fn send_reliable(&mut self, now: Millis, payload: &[u8]) -> Vec<u8> {
        let seq = self.next_reliable_seq;
        self.next_reliable_seq = self.next_reliable_seq.wrapping_add(1);

        let frame = Self::frame_reliable(seq, payload);
        self.pending_acks.insert(
            seq,
            PendingAck {
                bytes: Bytes::copy_from_slice(&frame),
                first_sent_at: now,
                last_sent_at: now,
                retry_count: 0,
            },
        );
        frame
    }

    fn frame_reliable(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(3 + payload.len());
        frame.push(MessageHeader::Reliable.to_byte());
        frame.write_u16(seq).expect("Vec<u8> write is infallible");
        frame.extend_from_slice(payload);
        frame
    }

    /// Scans `pendingAcks` for entries whose retransmit timeout elapsed
    /// and returns the frames that need resending, bumping their
    /// `lastSentAt`/`retryCount`. No cap on retry count; only the
    /// connection timeout bounds how long this can go on.
    pub fn retransmission_scan(&mut self, now: Millis) -> Vec<Vec<u8>> {
        let timeout = self.retransmit_timeout();
        let mut due = Vec::new();
        for pending in self.pending_acks.values_mut() {
            if now - pending.last_sent_at > timeout {
                pending.last_sent_at = now;
                pending.retry_count += 1;
                due.push(pending.bytes.to_vec());
            }
        }
        due
    }

    /// Processes one inbound reliable frame and returns both the
    /// duplicate-suppression outcome and the `Ack` frame that must always
    /// be sent in response.
    pub fn handle_reliable(&mut self, seq: u16) -> (ReceiveOutcome, Vec<u8>) {
        let outcome = if !self.received_any_reliable {
            self.received_any_reliable = true;
            self.last_received_seq = seq;
            self.receive_ack_bitfield = 0;
            ReceiveOutcome::Deliver
        } else {
            let diff = seq.wrapping_sub(self.last_received_seq) as i16;
            if diff > 0 {
                if diff as u32 >= ACK_WINDOW as u32 {
                    self.receive_ack_bitfield = 1;
                } else {
                    self.receive_ack_bitfield = (self.receive_ack_bitfield << diff) | 1;
                }
                self.last_received_seq = seq;
                ReceiveOutcome::Deliver
            } else if diff == 0 {
                ReceiveOutcome::Duplicate
            } else {
                let back = (-diff) as i32;
                if back > ACK_WINDOW as i32 {
                    ReceiveOutcome::TooOld
                } else {
                    let bit = 1u16 << (back - 1);
                    if self.receive_ack_bitfield & bit != 0 {
                        ReceiveOutcome::Duplicate
                    } else {
                        self.receive_ack_bitfield |= bit;
                        ReceiveOutcome::Deliver
                    }
                }
            }
        };

        let mut ack = Vec::with_capacity(5);
        ack.push(MessageHeader::Ack.to_byte());
        ack.write_u16(self.last_received_seq)
            .expect("Vec<u8> write is infallible");
        ack.write_u16(self.receive_ack_bitfield)
            .expect("Vec<u8> write is infallible");
        (outcome, ack)
    }

    /// Processes an inbound `Ack(ackedSeq, bitfield)`: removes the acked
    /// sequence and every sequence the bitfield marks received, sampling
    /// RTT for entries that were never retransmitted.
    pub fn handle_ack(&mut self, now: Millis, acked_seq: u16, bitfield: u16) {
        self.remove_acked(now, acked_seq);
        for i in 0..16u16 {
            if bitfield & (1 << i) != 0 {
                let seq = acked_seq.wrapping_sub(1 + i);
                self.remove_acked(now, seq);
            }
        }
    }

    fn remove_acked(&mut self, now: Millis, seq: u16) {
        if let Some(pending) = self.pending_acks.remove(&seq) {
            if pending.retry_count == 0 {
                self.sample_rtt(now - pending.first_sent_at);
            }
        }
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    /// True if it is time for a heartbeat; if so, records `lastHeartbeatSent`,
    /// remembers the timestamp as outstanding so the eventual echo can be
    /// told apart from a fresh probe from the peer, and returns the frame.
    pub fn maybe_heartbeat(&mut self, now: Millis) -> Option<Vec<u8>> {
        if now - self.last_heartbeat_sent < self.heartbeat_interval_ms {
            return None;
        }
        self.last_heartbeat_sent = now;
        self.pending_heartbeat_ts = Some(now);
        Some(Self::heartbeat_frame(now))
    }

    fn heartbeat_frame(timestamp: i64) -> Vec<u8> {
        let mut frame = Vec::with_capacity(9);
        frame.push(MessageHeader::Heartbeat.to_byte());
        frame
            .write_i64(timestamp)
            .expect("Vec<u8> write is infallible");
        frame
    }

    /// A `Heartbeat` frame arrived carrying `timestamp`. Under the
    /// symmetric-echo model (SPEC design note) the same frame kind serves
    /// both as a probe and as its own reply, so this tells the two apart
    /// by matching against our own outstanding probe timestamp:
    /// - it echoes our own probe back: sample RTT, consume it, reply `None`
    ///   (no further echo, or the two sides would ping-pong forever).
    /// - anything else: treat it as a fresh probe from the peer and echo
    ///   the same timestamp back exactly once.
    pub fn handle_heartbeat(&mut self, now: Millis, timestamp: i64) -> Option<Vec<u8>> {
        if self.pending_heartbeat_ts == Some(timestamp) {
            self.pending_heartbeat_ts = None;
            let rtt = now - timestamp;
            if rtt >= 0 {
                self.sample_rtt(rtt);
            }
            None
        } else {
            Some(Self::heartbeat_frame(timestamp))
        }
    }

    pub fn disconnect(&mut self, reason: DisconnectReason) -> Vec<u8> {
        self.state = ConnectionState::Disconnected;
        trace!(remote = %self.remote, ?reason, "connection disconnected");
        vec![MessageHeader::Disconnect.to_byte(), reason.to_byte()]
    }
}

/// Parses an inbound `Reliable` frame body (the 2-byte sequence that
/// follows the header byte) and returns the sequence plus the remaining
/// payload bytes.
pub fn parse_reliable_body(mut body: Bytes) -> surge_binary::Result<(u16, Bytes)> {
    let seq = body.read_u16()?;
    let payload = Bytes::from(body.read_remaining());
    Ok((seq, payload))
}

/// Parses an inbound `Ack`/`AckExtra` frame body.
pub fn parse_ack_body(mut body: Bytes) -> surge_binary::Result<(u16, u16)> {
    let seq = body.read_u16()?;
    let bitfield = body.read_u16()?;
    Ok((seq, bitfield))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn conn(now: Millis) -> Connection {
        Connection::new(
            addr(),
            ConnectionState::Connected,
            now,
            DEFAULT_TIMEOUT_MS,
            DEFAULT_HEARTBEAT_INTERVAL_MS,
        )
    }

    #[test]
    fn first_reliable_frame_is_always_delivered() {
        let mut c = conn(0);
        let (outcome, _ack) = c.handle_reliable(42);
        assert_eq!(outcome, ReceiveOutcome::Deliver);
        assert_eq!(c.last_received_seq, 42);
    }

    #[test]
    fn duplicate_frame_is_suppressed_but_still_acked() {
        let mut c = conn(0);
        c.handle_reliable(0);
        let (outcome, ack) = c.handle_reliable(0);
        assert_eq!(outcome, ReceiveOutcome::Duplicate);
        assert_eq!(ack[0], MessageHeader::Ack.to_byte());
    }

    #[test]
    fn boundary_at_exactly_16_behind_is_accepted_once() {
        let mut c = conn(0);
        c.handle_reliable(16);
        let (outcome, _) = c.handle_reliable(0);
        assert_eq!(outcome, ReceiveOutcome::Deliver);
        let (outcome2, _) = c.handle_reliable(0);
        assert_eq!(outcome2, ReceiveOutcome::Duplicate);
    }

    #[test]
    fn more_than_16_behind_is_too_old() {
        let mut c = conn(0);
        c.handle_reliable(17);
        let (outcome, _) = c.handle_reliable(0);
        assert_eq!(outcome, ReceiveOutcome::TooOld);
    }

    #[test]
    fn sequence_wraps_past_u16_max() {
        let mut c = conn(0);
        c.handle_reliable(u16::MAX);
        let (outcome, _) = c.handle_reliable(0);
        assert_eq!(outcome, ReceiveOutcome::Deliver);
        assert_eq!(c.last_received_seq, 0);
    }

    #[test]
    fn reliable_send_records_pending_ack_and_ack_clears_it() {
        let mut c = conn(0);
        let frame = c.send_reliable(0, &[0xDE, 0xAD]);
        assert_eq!(c.pending_ack_count(), 1);
        assert_eq!(frame[0], MessageHeader::Reliable.to_byte());

        c.handle_ack(20, 0, 0);
        assert_eq!(c.pending_ack_count(), 0);
        assert!(c.smoothed_rtt > 0.0);
    }

    #[test]
    fn ack_bitfield_clears_earlier_pending_sends() {
        let mut c = conn(0);
        c.send_reliable(0, b"a");
        c.send_reliable(1, b"b");
        c.send_reliable(2, b"c");
        assert_eq!(c.pending_ack_count(), 3);

        // Ack seq 2, bit 0 set => also acks seq 1.
        c.handle_ack(10, 2, 0b1);
        assert_eq!(c.pending_ack_count(), 1);
    }

    #[test]
    fn retransmission_scan_only_fires_after_timeout_elapses() {
        let mut c = conn(0);
        c.send_reliable(0, b"x");
        assert!(c.retransmission_scan(10).is_empty());
        let due = c.retransmission_scan(10_000);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn timeout_is_based_on_last_heard_from() {
        let mut c = conn(0);
        assert!(!c.is_timed_out(1000));
        assert!(c.is_timed_out(DEFAULT_TIMEOUT_MS + 1));
        c.touch(DEFAULT_TIMEOUT_MS + 1);
        assert!(!c.is_timed_out(DEFAULT_TIMEOUT_MS + 1));
    }

    #[test]
    fn echo_of_our_own_probe_samples_rtt_and_does_not_re_echo() {
        let mut c = conn(0);
        let frame = c.maybe_heartbeat(DEFAULT_HEARTBEAT_INTERVAL_MS).unwrap();
        assert_eq!(frame[0], MessageHeader::Heartbeat.to_byte());

        let reply = c.handle_heartbeat(DEFAULT_HEARTBEAT_INTERVAL_MS + 50, DEFAULT_HEARTBEAT_INTERVAL_MS);
        assert!(reply.is_none());
        assert_eq!(c.smoothed_rtt, 50.0);
    }

    #[test]
    fn fresh_probe_from_peer_is_echoed_once() {
        let mut c = conn(0);
        let reply = c.handle_heartbeat(500, 123);
        assert_eq!(reply, Some(Connection::heartbeat_frame(123)));
    }
}
