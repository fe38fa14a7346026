//! Event bus for session notifications
//!
//! A typed publish/subscribe registry scoped to one session instance (not a
//! process-global table, so several independent sessions can coexist).
//! Each event kind carries at most one handler; dispatch is synchronous and
//! a panicking handler never takes the emitting loop down with it.

pub mod types;

pub use types::{CallEvent, EventKind};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{CallError, Result};

/// Boxed event handler
pub type EventHandler = Box<dyn Fn(&CallEvent) + Send + Sync>;

/// Per-session event bus, one handler per event kind
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Arc<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the handler for an event kind
    ///
    /// Registering a second handler for the same kind is a contract
    /// violation and fails with `AlreadySubscribed`.
    pub fn register(&self, kind: EventKind, handler: EventHandler) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&kind) {
            return Err(CallError::AlreadySubscribed(kind.to_string()));
        }
        handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    /// Dispatch an event to its handler, if one is registered
    ///
    /// Handler panics are caught and logged so a misbehaving callback
    /// cannot break the loop that emitted the event. The registry lock is
    /// dropped before the handler runs, so handlers may register others.
    pub fn emit(&self, event: CallEvent) {
        let handler = self.handlers.read().get(&event.kind()).cloned();
        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                    warn!("Event handler for '{}' panicked", event.kind());
                }
            }
            None => debug!("No handler for event '{}'", event.kind()),
        }
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_register_and_emit() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        bus.register(
            EventKind::UserLeft,
            Box::new(move |event| {
                assert!(matches!(event, CallEvent::UserLeft { .. }));
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        bus.emit(CallEvent::UserLeft {
            session_id: "abc".to_string(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let bus = EventBus::new();
        bus.register(EventKind::Error, Box::new(|_| {})).unwrap();
        assert!(matches!(
            bus.register(EventKind::Error, Box::new(|_| {})),
            Err(CallError::AlreadySubscribed(_))
        ));
        // The original handler stays registered
        assert_eq!(bus.handler_count(), 1);
    }

    #[test]
    fn test_emit_without_handler_is_noop() {
        let bus = EventBus::new();
        bus.emit(CallEvent::Closed);
    }

    #[test]
    fn test_handler_may_register_from_callback() {
        let bus = Arc::new(EventBus::new());
        let bus2 = bus.clone();
        bus.register(
            EventKind::Closed,
            Box::new(move |_| {
                bus2.register(EventKind::Error, Box::new(|_| {})).unwrap();
            }),
        )
        .unwrap();

        bus.emit(CallEvent::Closed);
        assert_eq!(bus.handler_count(), 2);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        bus.register(EventKind::Closed, Box::new(|_| panic!("boom")))
            .unwrap();
        // Must not propagate the panic
        bus.emit(CallEvent::Closed);
        // Bus still usable afterwards
        bus.emit(CallEvent::Closed);
    }
}
