//! Wiring shared by the CLI commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use freetier::cache::{UsageCache, UsageClient};
use freetier::clock::DayResolver;
use freetier::config::Config;
use freetier::entitlement::{EntitlementGate, FileEntitlementStore};
use freetier::identity::{FileIdentityStore, Identity, IdentityResolver, UserId};
use freetier::ledger::{CounterStore, Feature, MemoryCounterStore, QuotaLedger, SqliteCounterStore};
use freetier::metrics::ServiceMetrics;

use super::IdentityArgs;

pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load_with(path).context("Failed to load configuration")
}

/// Counter store selected by `storage.database`.
pub(crate) fn counter_store(config: &Config) -> Result<Arc<dyn CounterStore>> {
    match &config.storage.database {
        Some(path) => {
            let store = SqliteCounterStore::open(path)
                .with_context(|| format!("Failed to open counter database {}", path.display()))?;
            info!(path = %path.display(), "Using SQLite counter store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No storage.database configured; counters are in-memory and reset on exit");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
    }
}

/// Build the full check/use stack from configuration.
pub(crate) fn build_client(config: &Config) -> Result<Arc<UsageClient>> {
    let entitlements_path = config.entitlements_path();
    if !entitlements_path.exists() {
        warn!(
            path = %entitlements_path.display(),
            "Entitlement file missing; user lookups will fail until it is written"
        );
    }
    let gate = Arc::new(EntitlementGate::with_capacity(
        Arc::new(FileEntitlementStore::new(entitlements_path)),
        config.cache.entitlement_ttl(),
        config.cache.max_entries,
    ));
    let days = DayResolver::system(config.utc_offset_minutes)?;
    let ledger = Arc::new(QuotaLedger::new(
        gate,
        counter_store(config)?,
        days,
        config.caps.clone(),
    ));
    let cache = UsageCache::new(config.cache.ttl(), config.cache.max_entries);
    Ok(Arc::new(UsageClient::new(
        ledger,
        cache,
        Arc::new(ServiceMetrics::new()),
    )))
}

pub(crate) fn identity_resolver(config: &Config) -> IdentityResolver {
    IdentityResolver::new(Arc::new(FileIdentityStore::in_dir(&config.device_dir())))
}

/// `--user`, then `--device`, then this installation's device id.
pub(crate) fn resolve_identity(config: &Config, who: &IdentityArgs) -> Result<Identity> {
    if who.user.is_some() || who.device.is_some() {
        return Ok(Identity::from_parts(
            who.user.as_deref(),
            who.device.as_deref(),
        )?);
    }
    identity_resolver(config)
        .resolve(None::<UserId>)
        .context("Failed to resolve device identity")
}

pub(crate) fn parse_feature(who: &IdentityArgs) -> Result<Feature> {
    Ok(who.feature.parse()?)
}
