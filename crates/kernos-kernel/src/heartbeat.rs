//! [`HeartbeatStore`] – last-liveness timestamps per kernel.
//!
//! Every running kernel calls [`KernelContext::heartbeat`][crate::handle::KernelContext::heartbeat]
//! at regular intervals, which lands in [`HeartbeatStore::record`].  The
//! tiered watchdog reads the store with [`HeartbeatStore::last_seen`] to find
//! kernels whose deadline has passed.
//!
//! Each record carries the `generation` of the kernel instance that produced
//! it.  Heartbeats from an older generation (an instance that has already been
//! replaced by a restart) are discarded.
//!
//! Locking is per entry: the outer map is only write-locked to register a new
//! kernel, and readers never observe a half-updated `(last_seen, generation)`
//! pair.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// Liveness record for a single kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub kernel_id: String,
    pub last_seen: Instant,
    pub generation: u64,
}

/// Shared map of kernel id → [`HeartbeatRecord`].
#[derive(Debug, Default)]
pub struct HeartbeatStore {
    entries: RwLock<HashMap<String, Arc<Mutex<HeartbeatRecord>>>>,
}

impl HeartbeatStore {
    /// Create an empty store with no registered kernels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel_id` at generation 0 with `last_seen` set to now.
    ///
    /// Registering an existing kernel is a no-op.
    pub fn register(&self, kernel_id: &str) {
        let mut entries = match self.entries.write() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.entry(kernel_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(HeartbeatRecord {
                kernel_id: kernel_id.to_string(),
                last_seen: Instant::now(),
                generation: 0,
            }))
        });
    }

    /// Record a heartbeat from generation `generation` of `kernel_id`.
    ///
    /// Returns `false` (and changes nothing) when the kernel is unknown or the
    /// heartbeat comes from a generation older than the recorded one.
    pub fn record(&self, kernel_id: &str, generation: u64) -> bool {
        let Some(entry) = self.entry(kernel_id) else {
            return false;
        };
        let mut record = match entry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        if generation < record.generation {
            return false;
        }
        record.generation = generation;
        record.last_seen = Instant::now();
        true
    }

    /// `(last_seen, generation)` for `kernel_id`, read atomically.
    pub fn last_seen(&self, kernel_id: &str) -> Option<(Instant, u64)> {
        self.get(kernel_id).map(|r| (r.last_seen, r.generation))
    }

    /// Copy of the full record for `kernel_id`.
    pub fn get(&self, kernel_id: &str) -> Option<HeartbeatRecord> {
        let entry = self.entry(kernel_id)?;
        let record = match entry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        Some(record.clone())
    }

    /// Time since the last accepted heartbeat of `kernel_id`.
    pub fn elapsed(&self, kernel_id: &str) -> Option<Duration> {
        self.last_seen(kernel_id).map(|(seen, _)| seen.elapsed())
    }

    fn entry(&self, kernel_id: &str) -> Option<Arc<Mutex<HeartbeatRecord>>> {
        let entries = match self.entries.read() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(kernel_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fresh_kernel_is_not_stale() {
        let store = HeartbeatStore::new();
        store.register("memory");
        assert_eq!(store.elapsed("memory"), Some(Duration::ZERO));
        assert_eq!(store.last_seen("memory").map(|(_, g)| g), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_resets_deadline() {
        let store = HeartbeatStore::new();
        store.register("ingest");
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.record("ingest", 0));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(store.elapsed("ingest"), Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_kernel_ages() {
        let store = HeartbeatStore::new();
        store.register("fast");
        store.register("slow");
        tokio::time::advance(Duration::from_secs(31)).await;
        store.record("slow", 0);

        assert_eq!(store.elapsed("fast"), Some(Duration::from_secs(31)));
        assert_eq!(store.elapsed("slow"), Some(Duration::ZERO));
        assert_eq!(store.elapsed("unknown"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn older_generation_is_discarded() {
        let store = HeartbeatStore::new();
        store.register("chat");
        assert!(store.record("chat", 2));
        let (before, _) = store.last_seen("chat").unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!store.record("chat", 1), "heartbeat from a replaced instance must be dropped");

        let (after, generation) = store.last_seen("chat").unwrap();
        assert_eq!(after, before);
        assert_eq!(generation, 2);
    }

    #[test]
    fn unknown_kernel_is_ignored() {
        let store = HeartbeatStore::new();
        assert!(!store.record("ghost", 0));
        assert!(store.last_seen("ghost").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reregister_keeps_existing_record() {
        let store = HeartbeatStore::new();
        store.register("governance");
        store.record("governance", 4);
        store.register("governance");
        assert_eq!(store.get("governance").map(|r| r.generation), Some(4));
    }
}
