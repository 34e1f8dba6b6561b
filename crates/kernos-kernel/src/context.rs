//! [`SupervisionContext`] – the one owner of mutable supervision state.
//!
//! Holds the [`HeartbeatStore`], the per-kernel state table and the
//! [`EventBus`].  It is created once per registry and shared (`Arc`) between
//! the orchestrator, the restart manager and the watchdogs.  The set of
//! kernels is fixed at construction, so the table itself is never locked;
//! each entry has its own mutex and no lock is held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kernos_middleware::EventBus;
use kernos_types::{EventType, KernelState, SupervisionEvent};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::heartbeat::HeartbeatStore;
use crate::registry::KernelRegistry;

/// Mutable status of one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelStatus {
    pub state: KernelState,
    /// Generation of the current (or most recently started) instance.
    pub generation: u64,
    pub reason: Option<String>,
    pub last_event: Option<EventType>,
    /// When the kernel entered `state`.
    pub since: Instant,
    pub restart_attempts: u32,
}

struct Entry {
    status: KernelStatus,
    /// Cancellation token of the live instance, if one was started.
    instance: Option<CancellationToken>,
}

pub struct SupervisionContext {
    heartbeats: Arc<HeartbeatStore>,
    kernels: HashMap<String, Mutex<Entry>>,
    bus: EventBus,
}

impl SupervisionContext {
    /// Build the state table for every kernel in `registry`, all `Pending`
    /// at generation 0.
    pub fn new(registry: &KernelRegistry, bus: EventBus) -> Self {
        let heartbeats = Arc::new(HeartbeatStore::new());
        let now = Instant::now();
        let kernels = registry
            .ids()
            .map(|id| {
                heartbeats.register(id);
                let entry = Entry {
                    status: KernelStatus {
                        state: KernelState::Pending,
                        generation: 0,
                        reason: None,
                        last_event: None,
                        since: now,
                        restart_attempts: 0,
                    },
                    instance: None,
                };
                (id.to_string(), Mutex::new(entry))
            })
            .collect();
        Self {
            heartbeats,
            kernels,
            bus,
        }
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatStore> {
        &self.heartbeats
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn status(&self, id: &str) -> Option<KernelStatus> {
        self.entry(id).map(|e| e.status.clone())
    }

    pub fn state(&self, id: &str) -> Option<KernelState> {
        self.entry(id).map(|e| e.status.state)
    }

    pub fn generation(&self, id: &str) -> u64 {
        self.entry(id).map(|e| e.status.generation).unwrap_or(0)
    }

    /// Bump the generation ahead of a restart and return the new value.
    pub fn advance_generation(&self, id: &str) -> u64 {
        match self.entry(id) {
            Some(mut e) => {
                e.status.generation += 1;
                e.status.generation
            }
            None => 0,
        }
    }

    /// Move `id` to `state`.  Unknown ids are ignored.
    pub fn transition(&self, id: &str, state: KernelState, reason: Option<String>) {
        if let Some(mut e) = self.entry(id) {
            if e.status.state != state {
                debug!(kernel = %id, from = %e.status.state, to = %state, "kernel state change");
                e.status.since = Instant::now();
            }
            e.status.state = state;
            e.status.reason = reason;
        }
    }

    /// Move `id` from `from` to `to` only if it is still in `from` at
    /// `generation`.  Returns whether the transition happened.
    pub fn transition_if(&self, id: &str, generation: u64, from: KernelState, to: KernelState) -> bool {
        match self.entry(id) {
            Some(mut e) if e.status.state == from && e.status.generation == generation => {
                debug!(kernel = %id, from = %from, to = %to, generation, "kernel state change");
                e.status.state = to;
                e.status.since = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Transition `id` to `state` and publish `event` about it.
    pub fn apply(&self, id: &str, state: KernelState, event: SupervisionEvent) {
        self.transition(id, state, event.reason().map(str::to_string));
        self.emit_for(id, event);
    }

    /// Publish `event` and remember it as the latest explanation for `id`.
    pub fn emit_for(&self, id: &str, event: SupervisionEvent) {
        if let Some(mut e) = self.entry(id) {
            e.status.last_event = Some(event.event_type);
            if let Some(reason) = event.reason() {
                e.status.reason = Some(reason.to_string());
            }
        }
        self.emit(event);
    }

    /// Publish an event not tied to a kernel's status.
    pub fn emit(&self, event: SupervisionEvent) {
        self.bus.publish(event);
    }

    pub fn set_restart_attempts(&self, id: &str, attempts: u32) {
        if let Some(mut e) = self.entry(id) {
            e.status.restart_attempts = attempts;
        }
    }

    pub fn set_instance(&self, id: &str, token: CancellationToken) {
        if let Some(mut e) = self.entry(id) {
            e.instance = Some(token);
        }
    }

    /// Detach the live instance's token; the caller is now responsible for
    /// stopping it.
    pub fn take_instance(&self, id: &str) -> Option<CancellationToken> {
        self.entry(id).and_then(|mut e| e.instance.take())
    }

    fn entry(&self, id: &str) -> Option<MutexGuard<'_, Entry>> {
        let entry = self.kernels.get(id)?;
        Some(match entry.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{KernelContext, KernelHandle};
    use crate::registry::KernelDescriptor;
    use async_trait::async_trait;
    use kernos_middleware::MemorySink;
    use kernos_types::KernosError;
    use std::time::Duration;

    struct Inert;

    #[async_trait]
    impl KernelHandle for Inert {
        async fn start(&self, _ctx: KernelContext) -> Result<(), KernosError> {
            Ok(())
        }
        async fn stop(&self, _grace: Duration) -> Result<(), KernosError> {
            Ok(())
        }
    }

    fn context() -> (SupervisionContext, Arc<MemorySink>) {
        let mut reg = KernelRegistry::new();
        reg.register(KernelDescriptor::new("memory", Arc::new(Inert))).unwrap();
        let bus = EventBus::default();
        let sink = Arc::new(MemorySink::new());
        bus.attach(sink.clone());
        (SupervisionContext::new(&reg, bus), sink)
    }

    #[tokio::test]
    async fn kernels_start_pending_and_registered_for_heartbeats() {
        let (ctx, _) = context();
        assert_eq!(ctx.state("memory"), Some(KernelState::Pending));
        assert!(ctx.heartbeats().last_seen("memory").is_some());
        assert_eq!(ctx.state("ghost"), None);
    }

    #[tokio::test]
    async fn apply_records_event_and_reason() {
        let (ctx, sink) = context();
        ctx.apply(
            "memory",
            KernelState::Degraded,
            SupervisionEvent::new(EventType::KernelDegraded, "memory").with("reason", "heartbeat stale"),
        );
        let status = ctx.status("memory").unwrap();
        assert_eq!(status.state, KernelState::Degraded);
        assert_eq!(status.reason.as_deref(), Some("heartbeat stale"));
        assert_eq!(status.last_event, Some(EventType::KernelDegraded));
        assert_eq!(sink.count(EventType::KernelDegraded, "memory"), 1);
    }

    #[tokio::test]
    async fn conditional_transition_checks_generation() {
        let (ctx, _) = context();
        ctx.transition("memory", KernelState::Running, None);
        ctx.advance_generation("memory");
        assert!(!ctx.transition_if("memory", 0, KernelState::Running, KernelState::Degraded));
        assert!(ctx.transition_if("memory", 1, KernelState::Running, KernelState::Degraded));
        assert!(!ctx.transition_if("memory", 1, KernelState::Running, KernelState::Degraded));
    }

    #[tokio::test]
    async fn instance_token_is_taken_once() {
        let (ctx, _) = context();
        ctx.set_instance("memory", CancellationToken::new());
        assert!(ctx.take_instance("memory").is_some());
        assert!(ctx.take_instance("memory").is_none());
    }
}
