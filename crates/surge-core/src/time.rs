//! Monotonic clock anchor and the delayed-event min-heap.
//!
//! All protocol timestamps are milliseconds since the owning `Peer` was
//! constructed, never wall-clock time — this keeps retransmission math and
//! tests immune to clock adjustments.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::Instant;

/// Milliseconds since a `Peer`'s `startTime`.
pub type Millis = i64;

/// Anchors the monotonic clock a `Peer` uses for every timestamp.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> Millis {
        self.start.elapsed().as_millis() as Millis
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::start()
    }
}

/// A scheduled action carried by the delayed-event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayedAction {
    /// Fire a heartbeat check for the connection at this endpoint.
    Heartbeat(SocketAddr),
    /// Grace period for a rejected connection's final retransmits elapsed;
    /// drop it from `pendingConnections` bookkeeping for good.
    CloseRejectedConnection(SocketAddr),
    /// `connectTimeoutMs` elapsed with no `accept`/`reject` call from the
    /// `handleConnection` callback; garbage-collect the stuck pending entry.
    ClosePendingConnection(SocketAddr),
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct Scheduled {
    fire_at: Millis,
    action: DelayedAction,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest `fire_at`.
        other.fire_at.cmp(&self.fire_at)
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of `(fireAt, action)`, per SPEC design note: schedules
/// heartbeats and the grace-period close of rejected connections.
#[derive(Debug, Default)]
pub struct DelayedEventQueue {
    heap: BinaryHeap<Scheduled>,
}

impl DelayedEventQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn schedule(&mut self, fire_at: Millis, action: DelayedAction) {
        self.heap.push(Scheduled { fire_at, action });
    }

    /// Removes and returns every action due at or before `now`, earliest first.
    pub fn drain_due(&mut self, now: Millis) -> Vec<DelayedAction> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.fire_at > now {
                break;
            }
            due.push(self.heap.pop().unwrap().action);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn drains_only_due_events_in_fire_at_order() {
        let mut queue = DelayedEventQueue::new();
        queue.schedule(300, DelayedAction::Heartbeat(addr(1)));
        queue.schedule(100, DelayedAction::CloseRejectedConnection(addr(2)));
        queue.schedule(200, DelayedAction::Heartbeat(addr(3)));

        let due = queue.drain_due(200);
        assert_eq!(
            due,
            vec![
                DelayedAction::CloseRejectedConnection(addr(2)),
                DelayedAction::Heartbeat(addr(3)),
            ]
        );
        assert!(!queue.is_empty());

        let rest = queue.drain_due(300);
        assert_eq!(rest, vec![DelayedAction::Heartbeat(addr(1))]);
        assert!(queue.is_empty());
    }

    #[test]
    fn clock_is_monotonic_non_negative() {
        let clock = Clock::start();
        let t0 = clock.now();
        let t1 = clock.now();
        assert!(t1 >= t0);
        assert!(t0 >= 0);
    }
}
