//! Caller-facing usage API.
//!
//! [`UsageClient`] is what request handlers talk to. It decides entitlement
//! once per call, answers premium callers without touching the ledger or the
//! cache, serves free-tier checks from the [`UsageCache`] while fresh, and
//! replaces the cached snapshot with the ledger's answer after every `use`.

use std::sync::Arc;

use tracing::debug;

use crate::entitlement::Entitlement;
use crate::error::Result;
use crate::identity::Identity;
use crate::ledger::{Feature, QuotaLedger, UsageCheck, UsageGrant, UsageSnapshot};
use crate::metrics::ServiceMetrics;

use super::UsageCache;

pub struct UsageClient {
    ledger: Arc<QuotaLedger>,
    cache: UsageCache,
    metrics: Arc<ServiceMetrics>,
}

impl UsageClient {
    pub fn new(ledger: Arc<QuotaLedger>, cache: UsageCache, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            ledger,
            cache,
            metrics,
        }
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn cache(&self) -> &UsageCache {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Current allowance for `identity`, from cache when fresh.
    pub async fn get_usage(&self, identity: &Identity, feature: Feature) -> Result<UsageCheck> {
        self.metrics.record_check();
        let entitlement = self.entitlement(identity).await?;

        if entitlement.is_unlimited() {
            let days = self.ledger.days();
            return Ok(UsageCheck {
                allowed: true,
                snapshot: UsageSnapshot::unlimited(
                    self.ledger.cap(feature),
                    days.today(),
                    days.next_reset(),
                ),
            });
        }

        if let Some(snapshot) = self.cache.get(identity, feature) {
            // A snapshot from before the day boundary says nothing about today.
            if snapshot.day == self.ledger.days().today() {
                self.metrics.record_cache_lookup(true);
                debug!(identity = %identity, feature = %feature, "Usage served from cache");
                return Ok(UsageCheck {
                    allowed: snapshot.has_allowance(),
                    snapshot,
                });
            }
            self.cache.invalidate(identity, feature);
        }
        self.metrics.record_cache_lookup(false);

        let generation = self.cache.generation();
        let check = self
            .ledger
            .check_as(identity, feature, entitlement)
            .await
            .inspect_err(|_| self.metrics.record_dependency_error())?;
        self.cache.fill(identity, feature, check.snapshot.clone(), generation);
        Ok(check)
    }

    /// Record one use of `feature`.
    ///
    /// On any ledger answer the cached snapshot is replaced with the ledger's;
    /// on error it is dropped so the next check goes to the ledger.
    pub async fn record_use(&self, identity: &Identity, feature: Feature) -> Result<UsageGrant> {
        let entitlement = match self.entitlement(identity).await {
            Ok(e) => e,
            Err(e) => {
                self.cache.invalidate(identity, feature);
                return Err(e);
            }
        };

        match self.ledger.consume_as(identity, feature, entitlement).await {
            Ok(grant) => {
                self.metrics.record_use(grant.success);
                if !entitlement.is_unlimited() {
                    self.cache.put(identity, feature, grant.snapshot.clone());
                }
                Ok(grant)
            }
            Err(e) => {
                self.metrics.record_dependency_error();
                self.cache.invalidate(identity, feature);
                Err(e)
            }
        }
    }

    async fn entitlement(&self, identity: &Identity) -> Result<Entitlement> {
        self.ledger
            .gate()
            .evaluate(identity)
            .await
            .inspect_err(|_| self.metrics.record_dependency_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DayResolver, ManualClock};
    use crate::entitlement::{EntitlementGate, MemoryEntitlementStore};
    use crate::error::FreeTierError;
    use crate::identity::{DeviceId, UserId};
    use crate::ledger::{CounterKey, CounterStore, DailyCaps, IncrementOutcome, MemoryCounterStore};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counter store wrapper that counts reads and can be switched off.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryCounterStore,
        reads: AtomicUsize,
        increments: AtomicUsize,
        down: AtomicBool,
    }

    impl CountingStore {
        fn check_up(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(FreeTierError::DependencyUnavailable("store down".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CounterStore for CountingStore {
        async fn count(&self, key: &CounterKey) -> Result<u32> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.check_up()?;
            self.inner.count(key).await
        }

        async fn try_increment(&self, key: &CounterKey, cap: u32) -> Result<IncrementOutcome> {
            self.increments.fetch_add(1, Ordering::SeqCst);
            self.check_up()?;
            self.inner.try_increment(key, cap).await
        }

        async fn history(
            &self,
            identity: &Identity,
            feature: Feature,
            since: crate::clock::UsageDay,
        ) -> Result<Vec<(crate::clock::UsageDay, u32)>> {
            self.inner.history(identity, feature, since).await
        }
    }

    struct Fixture {
        client: UsageClient,
        store: Arc<CountingStore>,
        entitlements: Arc<MemoryEntitlementStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        ));
        let entitlements = Arc::new(MemoryEntitlementStore::new());
        let store = Arc::new(CountingStore::default());
        let gate = Arc::new(EntitlementGate::new(
            entitlements.clone(),
            Duration::from_secs(15),
        ));
        let ledger = Arc::new(QuotaLedger::new(
            gate,
            store.clone(),
            DayResolver::new(clock.clone(), -360).unwrap(),
            DailyCaps::uniform(5),
        ));
        let client = UsageClient::new(
            ledger,
            UsageCache::new(ttl, 100),
            Arc::new(ServiceMetrics::new()),
        );
        Fixture {
            client,
            store,
            entitlements,
            clock,
        }
    }

    fn device() -> Identity {
        Identity::Device(DeviceId::new("device-1").unwrap())
    }

    #[tokio::test]
    async fn test_repeated_checks_hit_cache() {
        let f = fixture(UsageCache::DEFAULT_TTL);
        for _ in 0..5 {
            let check = f.client.get_usage(&device(), Feature::Solve).await.unwrap();
            assert_eq!(check.snapshot.remaining, Some(5));
        }
        assert_eq!(f.store.reads.load(Ordering::SeqCst), 1);
        let m = f.client.metrics().snapshot();
        assert_eq!(m.cache_hits, 4);
        assert_eq!(m.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_use_overwrites_cached_snapshot() {
        let f = fixture(UsageCache::DEFAULT_TTL);
        let me = device();
        assert_eq!(
            f.client.get_usage(&me, Feature::Solve).await.unwrap().snapshot.used,
            0
        );
        let grant = f.client.record_use(&me, Feature::Solve).await.unwrap();
        assert!(grant.success);

        let check = f.client.get_usage(&me, Feature::Solve).await.unwrap();
        assert_eq!(check.snapshot.used, 1, "must not serve the pre-use snapshot");
        assert_eq!(f.store.reads.load(Ordering::SeqCst), 1, "served from the fresh post-use entry");
    }

    #[tokio::test]
    async fn test_expired_entry_goes_to_ledger() {
        let f = fixture(Duration::ZERO);
        f.client.get_usage(&device(), Feature::Solve).await.unwrap();
        f.client.get_usage(&device(), Feature::Solve).await.unwrap();
        assert_eq!(f.store.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_snapshot_from_previous_day_is_ignored() {
        let f = fixture(Duration::from_secs(3600));
        let me = device();
        for _ in 0..5 {
            f.client.record_use(&me, Feature::Solve).await.unwrap();
        }
        assert!(!f.client.get_usage(&me, Feature::Solve).await.unwrap().allowed);

        f.clock.advance(ChronoDuration::days(1));
        let check = f.client.get_usage(&me, Feature::Solve).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.snapshot.remaining, Some(5));
    }

    #[tokio::test]
    async fn test_premium_bypasses_ledger_and_cache() {
        let f = fixture(UsageCache::DEFAULT_TTL);
        let alice = UserId::new("alice").unwrap();
        f.entitlements.set_premium(&alice, true);
        let me = Identity::User(alice);

        let check = f.client.get_usage(&me, Feature::Solve).await.unwrap();
        assert!(check.allowed);
        assert!(check.snapshot.is_premium);
        assert_eq!(check.snapshot.remaining, None);

        let grant = f.client.record_use(&me, Feature::Solve).await.unwrap();
        assert!(grant.success);

        assert_eq!(f.store.reads.load(Ordering::SeqCst), 0);
        assert_eq!(f.store.increments.load(Ordering::SeqCst), 0);
        assert!(f.client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_failed_use_evicts_cache_and_reports_error() {
        let f = fixture(UsageCache::DEFAULT_TTL);
        let me = device();
        f.client.get_usage(&me, Feature::Solve).await.unwrap();
        assert_eq!(f.client.cache().len(), 1);

        f.store.down.store(true, Ordering::SeqCst);
        let err = f.client.record_use(&me, Feature::Solve).await.unwrap_err();
        assert!(err.is_transient());
        assert!(f.client.cache().is_empty());
        assert_eq!(f.client.metrics().snapshot().dependency_errors, 1);

        f.store.down.store(false, Ordering::SeqCst);
        let check = f.client.get_usage(&me, Feature::Solve).await.unwrap();
        assert_eq!(check.snapshot.used, 0, "failed use must not have consumed a unit");
    }

    #[tokio::test]
    async fn test_rejected_use_is_cached_as_exhausted() {
        let f = fixture(UsageCache::DEFAULT_TTL);
        let me = device();
        for _ in 0..6 {
            f.client.record_use(&me, Feature::Solve).await.unwrap();
        }
        let reads_before = f.store.reads.load(Ordering::SeqCst);
        let check = f.client.get_usage(&me, Feature::Solve).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(f.store.reads.load(Ordering::SeqCst), reads_before);

        let m = f.client.metrics().snapshot();
        assert_eq!(m.grants, 5);
        assert_eq!(m.rejections, 1);
    }

    /// Counter store whose reads pause after taking their value until the
    /// test releases them.
    #[derive(Default)]
    struct ParkedReads {
        inner: MemoryCounterStore,
        parked: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl CounterStore for ParkedReads {
        async fn count(&self, key: &CounterKey) -> Result<u32> {
            let used = self.inner.count(key).await?;
            self.parked.notify_one();
            self.release.notified().await;
            Ok(used)
        }

        async fn try_increment(&self, key: &CounterKey, cap: u32) -> Result<IncrementOutcome> {
            self.inner.try_increment(key, cap).await
        }

        async fn history(
            &self,
            identity: &Identity,
            feature: Feature,
            since: crate::clock::UsageDay,
        ) -> Result<Vec<(crate::clock::UsageDay, u32)>> {
            self.inner.history(identity, feature, since).await
        }
    }

    #[tokio::test]
    async fn test_check_racing_use_does_not_overwrite_post_use_snapshot() {
        let store = Arc::new(ParkedReads::default());
        let gate = Arc::new(EntitlementGate::new(
            Arc::new(MemoryEntitlementStore::new()),
            Duration::from_secs(15),
        ));
        let ledger = Arc::new(QuotaLedger::new(
            gate,
            store.clone(),
            DayResolver::new(
                Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap())),
                -360,
            )
            .unwrap(),
            DailyCaps::uniform(5),
        ));
        let client = Arc::new(UsageClient::new(
            ledger,
            UsageCache::new(Duration::from_secs(3600), 100),
            Arc::new(ServiceMetrics::new()),
        ));
        let me = device();

        let check = {
            let client = client.clone();
            let me = me.clone();
            tokio::spawn(async move { client.get_usage(&me, Feature::Solve).await })
        };
        // The check has read used=0 and is parked before populating the cache.
        store.parked.notified().await;

        let grant = client.record_use(&me, Feature::Solve).await.unwrap();
        assert!(grant.success);
        assert_eq!(grant.snapshot.used, 1);

        store.release.notify_one();
        let stale = check.await.unwrap().unwrap();
        assert_eq!(stale.snapshot.used, 0);

        let cached = client.cache().get(&me, Feature::Solve).unwrap();
        assert_eq!(cached.used, 1, "post-use snapshot must survive the racing check");
    }
}
