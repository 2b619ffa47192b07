//! Premium entitlement gate.
//!
//! Every metered request passes through [`EntitlementGate::evaluate`] first.
//! The result is a single [`Entitlement`] value that the ledger and the usage
//! client branch on, so there is exactly one place that decides whether the
//! free-tier rules apply.
//!
//! Decisions for user identities are cached per process for a short TTL
//! (15 s by default), up to a fixed number of users; when the cache is full,
//! expired decisions are swept and then the oldest one is dropped. Store failures are propagated and never cached, so a
//! broken entitlement backend can only ever deny, not grant.

pub mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::Result;
use crate::identity::{Identity, UserId};

pub use store::{EntitlementRecord, EntitlementStore, FileEntitlementStore, MemoryEntitlementStore};

/// Outcome of the entitlement decision for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entitlement {
    /// Premium holder: no counting, no cap.
    Unlimited,
    /// Subject to the daily free-tier caps.
    FreeTier,
}

impl Entitlement {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

struct CachedDecision {
    premium: bool,
    fetched_at: Instant,
}

/// Entitlement decision point with a short-lived per-user cache.
pub struct EntitlementGate {
    store: Arc<dyn EntitlementStore>,
    cache: DashMap<UserId, CachedDecision>,
    ttl: Duration,
    max_entries: usize,
}

impl EntitlementGate {
    /// Default lifetime of a cached decision.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15);
    /// Default number of users with a cached decision.
    pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

    pub fn new(store: Arc<dyn EntitlementStore>, ttl: Duration) -> Self {
        Self::with_capacity(store, ttl, Self::DEFAULT_MAX_ENTRIES)
    }

    /// Gate caching at most `max_entries` decisions (clamped to at least 1).
    pub fn with_capacity(store: Arc<dyn EntitlementStore>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Decide whether `identity` is metered.
    ///
    /// Device identities are always [`Entitlement::FreeTier`] and never hit
    /// the store.
    pub async fn evaluate(&self, identity: &Identity) -> Result<Entitlement> {
        let Some(user) = identity.user_id() else {
            return Ok(Entitlement::FreeTier);
        };

        if let Some(premium) = self.cached(user) {
            return Ok(Self::decision(premium));
        }

        let premium = match self.store.is_premium(user).await {
            Ok(p) => p,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Entitlement lookup failed");
                return Err(e);
            }
        };
        debug!(identity = %identity, premium, "Entitlement refreshed");
        self.remember(user, premium);
        Ok(Self::decision(premium))
    }

    /// Drop any cached decision for `user`, forcing the next evaluation to
    /// read the store.
    pub fn invalidate(&self, user: &UserId) {
        self.cache.remove(user);
    }

    /// Number of users with a cached decision (fresh or stale).
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, user: &UserId) -> Option<bool> {
        let entry = self.cache.get(user)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.premium)
        } else {
            None
        }
    }

    fn remember(&self, user: &UserId, premium: bool) {
        self.cache.remove(user);
        if self.cache.len() >= self.max_entries {
            let ttl = self.ttl;
            self.cache.retain(|_, d| d.fetched_at.elapsed() < ttl);
        }
        while self.cache.len() >= self.max_entries {
            // Collect the key first: removing while iterating deadlocks the shard.
            let oldest = self
                .cache
                .iter()
                .min_by_key(|e| e.value().fetched_at)
                .map(|e| e.key().clone());
            let Some(oldest) = oldest else { break };
            debug!(user = %oldest, "Evicting oldest entitlement decision");
            self.cache.remove(&oldest);
        }
        self.cache.insert(
            user.clone(),
            CachedDecision {
                premium,
                fetched_at: Instant::now(),
            },
        );
    }

    fn decision(premium: bool) -> Entitlement {
        if premium {
            Entitlement::Unlimited
        } else {
            Entitlement::FreeTier
        }
    }
}
