//! The public event surface: subscribable client events.
//!
//! A generic `Map<string, Handler>` carrying untyped variadic handlers
//! doesn't exist in Rust anyway, but the naive translation (one
//! `Vec<Box<dyn Fn>>` per event name, each with its own argument list)
//! would multiply boilerplate for no benefit here, since every event is
//! dispatched from the same single-threaded task. This crate instead
//! represents every event as one variant of a single strongly-typed
//! [`Event`] enum and gives callers one [`EventSink`] to subscribe
//! against; matching on the enum is exhaustive at compile time, which is
//! the property a per-event handler map is actually after.

use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;

use crate::client::{LifecycleState, PeerTransport};
use crate::identity::PeerId;

/// One occurrence of a subscribable client event.
#[derive(Debug, Clone)]
pub enum Event {
    Connect,
    Disconnect,
    PeerJoin(PeerId),
    PeerDisconnect(PeerId),
    PeerStatus(PeerId, PeerTransport),
    Message(PeerId, Bytes),
    AuthorityMessage(Bytes),
    Ephemeral(serde_json::Value),
    Error(String),
    LifecycleStateChange(LifecycleState),
    TopologyChange(crate::topology::Topology, &'static str),
}

type Listener = Box<dyn FnMut(&Event) + Send>;

/// A registry of event listeners plus synchronous, panic-isolated
/// dispatch. One unhandled panic in a listener is logged and does not
/// prevent the remaining listeners from running: an application handler
/// that panics is caught around that one dispatch and does not abort
/// dispatch to the handlers after it.
#[derive(Default)]
pub struct EventSink {
    listeners: Vec<Listener>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener invoked for every event. Callers that only
    /// care about one event kind should match on the enum inside the
    /// closure; this keeps the subscription surface exhaustively typed
    /// while still letting callers filter by whatever they need.
    pub fn subscribe<F: FnMut(&Event) + Send + 'static>(&mut self, f: F) {
        self.listeners.push(Box::new(f));
    }

    /// Same as [`EventSink::subscribe`] for a listener that is already
    /// boxed, so a [`Command::Subscribe`](crate::client) arriving from a
    /// `Client` handle can be pushed straight in without re-boxing.
    pub(crate) fn subscribe_boxed(&mut self, f: Listener) {
        self.listeners.push(f);
    }

    pub(crate) fn emit(&mut self, event: Event) {
        for listener in self.listeners.iter_mut() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if let Err(e) = result {
                log::error!("event listener panicked while handling {event:?}: {e:?}");
            }
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn dispatch_reaches_all_listeners_despite_panic() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut sink = EventSink::new();

        sink.subscribe(|_e| panic!("boom"));
        let count_clone = count.clone();
        sink.subscribe(move |_e| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        sink.emit(Event::Connect);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
