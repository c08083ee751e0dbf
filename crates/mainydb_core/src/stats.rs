//! Per-collection operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic operation counters for one collection.
///
/// Counters are advisory and not persisted; they reset on reopen.
#[derive(Debug, Default)]
pub struct CollectionStats {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
}

impl CollectionStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` inserted documents.
    pub fn record_inserts(&self, n: u64) {
        self.inserts.fetch_add(n, Ordering::Relaxed);
    }

    /// Records `n` updated documents.
    pub fn record_updates(&self, n: u64) {
        self.updates.fetch_add(n, Ordering::Relaxed);
    }

    /// Records `n` deleted documents.
    pub fn record_deletes(&self, n: u64) {
        self.deletes.fetch_add(n, Ordering::Relaxed);
    }

    /// Records one query (find, count, distinct, or aggregate).
    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Total documents inserted since open.
    #[must_use]
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Total documents updated since open.
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Total documents deleted since open.
    #[must_use]
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Total queries since open.
    #[must_use]
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}
