//! Per-profile report statistics.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a profile's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStats {
    /// Collection cycles that produced a payload
    pub reports_generated: u64,
    /// Payloads delivered on first attempt
    pub reports_delivered: u64,
    /// Payloads pushed into the retry cache
    pub reports_cached: u64,
    /// Cached payloads dropped by eviction
    pub reports_evicted: u64,
    /// Cached payloads delivered later
    pub reports_flushed: u64,
    /// Cycles aborted before delivery
    pub failures: u64,
    /// Triggers dropped because a report was running
    pub triggers_dropped: u64,
    /// Total payload bytes generated
    pub bytes_generated: u64,
    /// Duration of the last cycle in milliseconds
    pub last_elapsed_ms: u64,
    /// Longest cycle in milliseconds
    pub max_elapsed_ms: u64,
}

/// Tracks report statistics with atomic operations.
#[derive(Debug, Default)]
pub struct StatsTracker {
    reports_generated: AtomicU64,
    reports_delivered: AtomicU64,
    reports_cached: AtomicU64,
    reports_evicted: AtomicU64,
    reports_flushed: AtomicU64,
    failures: AtomicU64,
    triggers_dropped: AtomicU64,
    bytes_generated: AtomicU64,
    last_elapsed_ms: AtomicU64,
    max_elapsed_ms: AtomicU64,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_generated(&self, bytes: usize) {
        self.reports_generated.fetch_add(1, AtomicOrdering::Relaxed);
        self.bytes_generated
            .fetch_add(bytes as u64, AtomicOrdering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.reports_delivered.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_cached(&self, evicted: bool) {
        self.reports_cached.fetch_add(1, AtomicOrdering::Relaxed);
        if evicted {
            self.reports_evicted.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub fn record_flushed(&self, count: usize) {
        self.reports_flushed
            .fetch_add(count as u64, AtomicOrdering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_dropped_trigger(&self) {
        self.triggers_dropped.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_elapsed(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.last_elapsed_ms.store(ms, AtomicOrdering::Relaxed);
        self.max_elapsed_ms.fetch_max(ms, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> ReportStats {
        ReportStats {
            reports_generated: self.reports_generated.load(AtomicOrdering::Relaxed),
            reports_delivered: self.reports_delivered.load(AtomicOrdering::Relaxed),
            reports_cached: self.reports_cached.load(AtomicOrdering::Relaxed),
            reports_evicted: self.reports_evicted.load(AtomicOrdering::Relaxed),
            reports_flushed: self.reports_flushed.load(AtomicOrdering::Relaxed),
            failures: self.failures.load(AtomicOrdering::Relaxed),
            triggers_dropped: self.triggers_dropped.load(AtomicOrdering::Relaxed),
            bytes_generated: self.bytes_generated.load(AtomicOrdering::Relaxed),
            last_elapsed_ms: self.last_elapsed_ms.load(AtomicOrdering::Relaxed),
            max_elapsed_ms: self.max_elapsed_ms.load(AtomicOrdering::Relaxed),
        }
    }
}
