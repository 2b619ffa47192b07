//! Counter storage for the quota ledger.
//!
//! The only mutation a [`CounterStore`] exposes is [`CounterStore::try_increment`],
//! which must decide and apply "+1 if below cap" as one atomic step. Splitting
//! it into a read followed by a write lets two concurrent callers both see
//! `count < cap` and both write, overshooting the cap.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::clock::UsageDay;
use crate::error::Result;
use crate::identity::{Identity, IdentityKind};

use super::Feature;

/// Primary key of a usage counter row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub kind: IdentityKind,
    pub identity: String,
    pub feature: Feature,
    pub day: UsageDay,
}

impl CounterKey {
    pub fn new(identity: &Identity, feature: Feature, day: UsageDay) -> Self {
        Self {
            kind: identity.kind(),
            identity: identity.value().to_string(),
            feature,
            day,
        }
    }
}

/// Result of a conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// One unit was accepted; the value is the new persisted count.
    Granted(u32),
    /// Nothing was written; the value is the unchanged persisted count.
    Exhausted(u32),
}

/// Durable usage counters keyed by (identity, feature, day).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count for `key`; `0` when no row exists.
    async fn count(&self, key: &CounterKey) -> Result<u32>;

    /// Atomically insert `count = 1` (row absent) or apply `count = count + 1`
    /// (row present), but only while the count is below `cap`.
    async fn try_increment(&self, key: &CounterKey, cap: u32) -> Result<IncrementOutcome>;

    /// Rows for one identity and feature on or after `since`, newest first.
    async fn history(
        &self,
        identity: &Identity,
        feature: Feature,
        since: UsageDay,
    ) -> Result<Vec<(UsageDay, u32)>>;
}

/// Single-process counter store.
///
/// Each increment decision runs inside one lock acquisition. Counters are
/// lost on restart and not shared between instances; use the SQLite store
/// for anything beyond one process.
#[derive(Default)]
pub struct MemoryCounterStore {
    rows: Mutex<HashMap<CounterKey, u32>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counter rows that exist.
    pub fn row_count(&self) -> usize {
        self.rows.lock().expect("counter lock poisoned").len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn count(&self, key: &CounterKey) -> Result<u32> {
        let rows = self.rows.lock().expect("counter lock poisoned");
        Ok(rows.get(key).copied().unwrap_or(0))
    }

    async fn try_increment(&self, key: &CounterKey, cap: u32) -> Result<IncrementOutcome> {
        let mut rows = self.rows.lock().expect("counter lock poisoned");
        let current = rows.get(key).copied().unwrap_or(0);
        if current >= cap {
            return Ok(IncrementOutcome::Exhausted(current));
        }
        let next = current + 1;
        rows.insert(key.clone(), next);
        Ok(IncrementOutcome::Granted(next))
    }

    async fn history(
        &self,
        identity: &Identity,
        feature: Feature,
        since: UsageDay,
    ) -> Result<Vec<(UsageDay, u32)>> {
        let rows = self.rows.lock().expect("counter lock poisoned");
        let mut out: Vec<(UsageDay, u32)> = rows
            .iter()
            .filter(|(k, _)| {
                k.kind == identity.kind()
                    && k.identity == identity.value()
                    && k.feature == feature
                    && k.day >= since
            })
            .map(|(k, count)| (k.day, *count))
            .collect();
        out.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(out)
    }
}
