//! Shared base embedded by both `Client` and `Server`: the monotonic
//! clock, the delayed-event queue, the message pool, and the inbound
//! datagram drain. `Client`/`Server` each own their connection state and
//! implement their own `tick()`, calling into this for the parts that
//! don't differ between them.

use crate::message::MessagePool;
use crate::time::{Clock, DelayedAction, DelayedEventQueue, Millis};
use crate::transport::Datagram;
use tokio::sync::mpsc::UnboundedReceiver;

/// The state every peer (client or server) carries regardless of how many
/// connections it owns.
pub struct Peer {
    clock: Clock,
    delayed_events: DelayedEventQueue,
    pool: MessagePool,
    inbound_rx: UnboundedReceiver<Datagram>,
}

impl Peer {
    pub fn new(inbound_rx: UnboundedReceiver<Datagram>) -> Self {
        Self {
            clock: Clock::start(),
            delayed_events: DelayedEventQueue::new(),
            pool: MessagePool::new(),
            inbound_rx,
        }
    }

    pub fn now(&self) -> Millis {
        self.clock.now()
    }

    pub fn pool_mut(&mut self) -> &mut MessagePool {
        &mut self.pool
    }

    pub fn schedule(&mut self, fire_at: Millis, action: DelayedAction) {
        self.delayed_events.schedule(fire_at, action);
    }

    /// Drains every datagram currently queued by the background transport
    /// task without blocking. Called once per `tick()`.
    pub fn drain_inbound(&mut self) -> Vec<Datagram> {
        let mut datagrams = Vec::new();
        while let Ok(datagram) = self.inbound_rx.try_recv() {
            datagrams.push(datagram);
        }
        datagrams
    }

    /// Returns every delayed action due at or before `now`, earliest first.
    /// Per SPEC §5 ordering: called after inbound processing, before
    /// per-connection heartbeats.
    pub fn due_events(&mut self, now: Millis) -> Vec<DelayedAction> {
        self.delayed_events.drain_due(now)
    }
}
