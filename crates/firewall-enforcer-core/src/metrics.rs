//! Global atomic counters for enforcer observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the batch does this when it finishes).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::compute::MutationKind;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations or locking.
pub struct Metrics {
    projects_enforced: AtomicU64,
    rules_deleted: AtomicU64,
    rules_inserted: AtomicU64,
    rules_updated: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            projects_enforced: AtomicU64::new(0),
            rules_deleted: AtomicU64::new(0),
            rules_inserted: AtomicU64::new(0),
            rules_updated: AtomicU64::new(0),
        }
    }

    pub fn inc_projects_enforced(&self) {
        self.projects_enforced.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "projects_enforced", "counter incremented");
    }

    /// Count one successful mutating call.
    pub fn inc_mutation(&self, kind: MutationKind) {
        let counter = match kind {
            MutationKind::Delete => &self.rules_deleted,
            MutationKind::Insert => &self.rules_inserted,
            MutationKind::Update => &self.rules_updated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rules_mutated", kind = %kind, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            projects_enforced = self.projects_enforced(),
            rules_deleted = self.rules_deleted(),
            rules_inserted = self.rules_inserted(),
            rules_updated = self.rules_updated(),
        );
    }

    pub fn projects_enforced(&self) -> u64 {
        self.projects_enforced.load(Ordering::Relaxed)
    }

    pub fn rules_deleted(&self) -> u64 {
        self.rules_deleted.load(Ordering::Relaxed)
    }

    pub fn rules_inserted(&self) -> u64 {
        self.rules_inserted.load(Ordering::Relaxed)
    }

    pub fn rules_updated(&self) -> u64 {
        self.rules_updated.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.projects_enforced.store(0, Ordering::Relaxed);
        self.rules_deleted.store(0, Ordering::Relaxed);
        self.rules_inserted.store(0, Ordering::Relaxed);
        self.rules_updated.store(0, Ordering::Relaxed);
    }
}
