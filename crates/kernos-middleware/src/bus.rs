//! Publish side of supervision events.
//!
//! Every component that reports something (orchestrator, watchdog, restart
//! manager, process supervisor) holds a clone of one [`EventBus`].  The bus
//! fans each event out to the attached [`EventSink`]s in publish order, on the
//! publishing task.  The [`EventJournal`][crate::journal::EventJournal] is the
//! sink other processes read from; [`MemorySink`] keeps events in memory.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use kernos_types::{EventType, KernosError, SupervisionEvent};
use tracing::{debug, warn};

/// A durable consumer of supervision events.
///
/// A failing sink is logged and skipped; it never fails the publisher.
pub trait EventSink: Send + Sync {
    fn write(&self, event: &SupervisionEvent) -> Result<(), KernosError>;
}

/// Shared event bus. Clone it cheaply – all clones share the same sink list.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a durable sink.  Applies to every clone of this bus.
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => sinks.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    /// Write `event` to every attached sink.  Having no sink is a normal
    /// condition.
    pub fn publish(&self, event: SupervisionEvent) {
        let sinks = match self.sinks.read() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if sinks.is_empty() {
            debug!(event_type = %event.event_type, subject = %event.subject, "no event sinks attached");
            return;
        }
        for sink in sinks.iter() {
            if let Err(e) = sink.write(&event) {
                warn!(error = %e, event_type = %event.event_type, "event sink write failed");
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sinks = self.sinks.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("sinks", &sinks).finish()
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Sink that keeps every event in memory.  Useful for embedding and tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<SupervisionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far, in publish order.
    pub fn events(&self) -> Vec<SupervisionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of events of `event_type` about `subject`.
    pub fn count(&self, event_type: EventType, subject: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type && e.subject == subject)
            .count()
    }
}

impl EventSink for MemorySink {
    fn write(&self, event: &SupervisionEvent) -> Result<(), KernosError> {
        self.events
            .lock()
            .map_err(|e| KernosError::Channel(format!("memory sink poisoned: {e}")))?
            .push(event.clone());
        Ok(())
    }
}
