//! The datagram transport capability the core consumes (`Transport` in
//! SPEC §6) plus two implementations: a real UDP socket, and an in-memory
//! loopback pair used by the integration tests.
//!
//! The background receive side always runs off-thread and only ever
//! *enqueues* into an `UnboundedReceiver<Datagram>`; the core drains that
//! queue itself inside `Peer::tick`, so no transport implementation is
//! allowed to call back into the engine directly.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

/// One inbound datagram and the endpoint it arrived from.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Bytes,
    pub from: SocketAddr,
}

/// The receiving half of a transport's inbound channel, handed to a
/// `Peer` at construction time.
pub type InboundRx = UnboundedReceiver<Datagram>;

/// Non-blocking send side of the transport capability. Receiving happens
/// out-of-band through the `UnboundedReceiver<Datagram>` handed back by
/// whichever constructor created the transport.
pub trait Transport: Send + Sync {
    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Real UDP transport. Binds one socket, spawns a background task that
/// forwards every inbound packet into the returned channel, and exposes
/// non-blocking sends via `UdpSocket::try_send_to`.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<(Self, UnboundedReceiver<Datagram>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        debug!(local = %socket.local_addr()?, "UDP transport bound");

        let (tx, rx) = mpsc::unbounded_channel();
        let recv_socket = Arc::clone(&socket);
        tokio::spawn(receive_loop(recv_socket, tx));

        Ok((Self { socket }, rx))
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, tx: UnboundedSender<Datagram>) {
    let mut buf = vec![0u8; 2048];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                trace!(%from, len, "datagram received");
                let bytes = Bytes::copy_from_slice(&buf[..len]);
                if tx.send(Datagram { bytes, from }).is_err() {
                    // Receiver side (the owning Peer) dropped; nothing left to do.
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "UDP receive error, stopping receive loop");
                return;
            }
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        match self.socket.try_send_to(bytes, to) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// A rule deciding whether an outbound datagram on a `LoopbackTransport`
/// should be silently dropped, used to simulate a lossy link in tests.
/// Receives the raw frame bytes (header byte included) and the number of
/// datagrams already sent from this endpoint.
pub type DropRule = Arc<dyn Fn(&[u8], u64) -> bool + Send + Sync>;

struct LoopboxState {
    peer_tx: Option<UnboundedSender<Datagram>>,
    sent_count: u64,
    drop_rule: Option<DropRule>,
}

/// In-memory transport pairing two endpoints without touching a real
/// socket. `pair()` wires both directions; `LoopbackTransport::lossy`
/// installs a `DropRule` to emulate packet loss for scenario S2.
pub struct LoopbackTransport {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Mutex<LoopboxState>,
}

impl LoopbackTransport {
    /// Builds a connected pair of loopback transports, `a` and `b`, each
    /// addressed by the given socket addresses and delivering into its
    /// own returned receiver.
    pub fn pair(
        addr_a: SocketAddr,
        addr_b: SocketAddr,
    ) -> (
        Arc<Self>,
        UnboundedReceiver<Datagram>,
        Arc<Self>,
        UnboundedReceiver<Datagram>,
    ) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Arc::new(Self {
            local_addr: addr_a,
            peer_addr: addr_b,
            state: Mutex::new(LoopboxState {
                peer_tx: Some(tx_b),
                sent_count: 0,
                drop_rule: None,
            }),
        });
        let b = Arc::new(Self {
            local_addr: addr_b,
            peer_addr: addr_a,
            state: Mutex::new(LoopboxState {
                peer_tx: Some(tx_a),
                sent_count: 0,
                drop_rule: None,
            }),
        });

        (a, rx_a, b, rx_b)
    }

    /// Installs a drop rule on this endpoint's outbound path.
    pub fn set_drop_rule(&self, rule: DropRule) {
        self.state.lock().unwrap().drop_rule = Some(rule);
    }
}

impl Transport for LoopbackTransport {
    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if to != self.peer_addr {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("loopback transport only reaches {}", self.peer_addr),
            ));
        }

        let sent_count = state.sent_count;
        state.sent_count += 1;

        if let Some(rule) = state.drop_rule.clone() {
            if rule(bytes, sent_count) {
                trace!(from = %self.local_addr, "loopback datagram dropped by test rule");
                return Ok(());
            }
        }

        if let Some(tx) = &state.peer_tx {
            let _ = tx.send(Datagram {
                bytes: Bytes::copy_from_slice(bytes),
                from: self.local_addr,
            });
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// An in-memory switch addressing many endpoints, for integration tests
/// that need one server talking to several independent clients (unlike
/// `LoopbackTransport::pair`, which only ever connects two).
pub struct LoopbackHub {
    routes: Mutex<std::collections::HashMap<SocketAddr, UnboundedSender<Datagram>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Registers `addr` on the hub and returns its send-side transport and
    /// inbound receiver.
    pub fn endpoint(self: &Arc<Self>, addr: SocketAddr) -> (Arc<HubTransport>, UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(addr, tx);
        (
            Arc::new(HubTransport {
                local_addr: addr,
                hub: Arc::clone(self),
                sent_count: Mutex::new(0),
                drop_rule: Mutex::new(None),
            }),
            rx,
        )
    }
}

pub struct HubTransport {
    local_addr: SocketAddr,
    hub: Arc<LoopbackHub>,
    sent_count: Mutex<u64>,
    drop_rule: Mutex<Option<DropRule>>,
}

impl HubTransport {
    pub fn set_drop_rule(&self, rule: DropRule) {
        *self.drop_rule.lock().unwrap() = Some(rule);
    }
}

impl Transport for HubTransport {
    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        let count = {
            let mut count = self.sent_count.lock().unwrap();
            let current = *count;
            *count += 1;
            current
        };

        if let Some(rule) = self.drop_rule.lock().unwrap().clone() {
            if rule(bytes, count) {
                trace!(from = %self.local_addr, %to, "hub datagram dropped by test rule");
                return Ok(());
            }
        }

        let routes = self.hub.routes.lock().unwrap();
        if let Some(tx) = routes.get(&to) {
            let _ = tx.send(Datagram {
                bytes: Bytes::copy_from_slice(bytes),
                from: self.local_addr,
            });
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_pair_delivers_in_order() {
        let a_addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let (a, _rx_a, b, mut rx_b) = LoopbackTransport::pair(a_addr, b_addr);

        a.send_to(&[1, 2, 3], b_addr).unwrap();
        a.send_to(&[4, 5, 6], b_addr).unwrap();

        let first = rx_b.try_recv().unwrap();
        let second = rx_b.try_recv().unwrap();
        assert_eq!(first.bytes.as_ref(), &[1, 2, 3]);
        assert_eq!(second.bytes.as_ref(), &[4, 5, 6]);
        assert_eq!(first.from, a_addr);

        let _ = b;
    }

    #[test]
    fn drop_rule_suppresses_first_n_sends() {
        let a_addr: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:9004".parse().unwrap();
        let (a, _rx_a, _b, mut rx_b) = LoopbackTransport::pair(a_addr, b_addr);
        a.set_drop_rule(Arc::new(|_bytes, count| count < 2));

        a.send_to(&[0xAA], b_addr).unwrap();
        a.send_to(&[0xBB], b_addr).unwrap();
        a.send_to(&[0xCC], b_addr).unwrap();

        let only = rx_b.try_recv().unwrap();
        assert_eq!(only.bytes.as_ref(), &[0xCC]);
        assert!(rx_b.try_recv().is_err());
    }
}
