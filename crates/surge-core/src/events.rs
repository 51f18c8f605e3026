//! Observer-registry event dispatch.
//!
//! SPEC §9 asks for a broadcast delegate to be reimplemented as a registry
//! of independent listeners invoked synchronously, in registration order,
//! rather than a single multi-cast delegate. `EventSlot<T>` is that
//! registry for one event; `Client`/`Server` hold one slot per event kind.

/// A boxed listener for one event carrying payload `T`.
type Listener<T> = Box<dyn FnMut(&T) + Send>;

/// All listeners registered for a single event. Registration only happens
/// outside `tick()` in this design (SPEC §9) — listeners are pushed
/// directly, never buffered, since nothing here calls back into the
/// engine's mutating API during registration.
pub struct EventSlot<T> {
    listeners: Vec<Listener<T>>,
}

impl<T> EventSlot<T> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Invokes every listener in declaration order. Listener panics are
    /// not caught; per SPEC §7 that is the caller's responsibility, not
    /// the engine's.
    pub fn fire(&mut self, event: &T) {
        for listener in &mut self.listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<T> Default for EventSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn listeners_fire_in_registration_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut slot: EventSlot<u32> = EventSlot::new();

        let t1 = Arc::clone(&trace);
        slot.subscribe(move |v| t1.lock().unwrap().push(("first", *v)));
        let t2 = Arc::clone(&trace);
        slot.subscribe(move |v| t2.lock().unwrap().push(("second", *v)));

        slot.fire(&7);

        assert_eq!(
            *trace.lock().unwrap(),
            vec![("first", 7), ("second", 7)]
        );
    }
}
