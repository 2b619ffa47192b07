//! Lock-free service counters.
//!
//! Exposed on `GET /api/metrics` and emitted as a structured
//! `usage_summary` log line on shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

/// Process-local counters for the quota service.
#[derive(Debug)]
pub struct ServiceMetrics {
    /// `check` calls answered.
    pub checks: AtomicU64,
    /// Successful `use` calls (units accepted, premium included).
    pub grants: AtomicU64,
    /// `use` calls rejected because the daily cap was reached.
    pub rejections: AtomicU64,
    /// Calls that failed because a store was unavailable.
    pub dependency_errors: AtomicU64,
    /// Free-tier `check` calls served from the usage cache.
    pub cache_hits: AtomicU64,
    /// Free-tier `check` calls that went through to the ledger.
    pub cache_misses: AtomicU64,
    /// Whether the server has finished wiring and is accepting requests.
    pub ready: AtomicBool,
}

/// Plain copy of the counters, for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub checks: u64,
    pub grants: u64,
    pub rejections: u64,
    pub dependency_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub ready: bool,
}

impl ServiceMetrics {
    /// Zeroed counters with `ready = false`.
    pub fn new() -> Self {
        Self {
            checks: AtomicU64::new(0),
            grants: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            dependency_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            ready: AtomicBool::new(false),
        }
    }

    pub fn record_check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_use(&self, success: bool) {
        if success {
            self.grants.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dependency_error(&self) {
        self.dependency_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            grants: self.grants.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            dependency_errors: self.dependency_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            ready: self.ready.load(Ordering::SeqCst),
        }
    }

    /// Emit current counters as a structured log line.
    pub fn emit_usage(&self, reason: &str) {
        let s = self.snapshot();
        info!(
            event = "usage_summary",
            reason = reason,
            checks = s.checks,
            grants = s.grants,
            rejections = s.rejections,
            dependency_errors = s.dependency_errors,
            cache_hits = s.cache_hits,
            cache_misses = s.cache_misses,
            "Usage metrics"
        );
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
