//! Daily free-tier quota ledger.
//!
//! Per (identity, feature, usage day) a counter moves through three states:
//! no row yet, `0 < count < cap`, and `count >= cap`. The last one is terminal
//! until the usage day advances, at which point a fresh key starts from
//! nothing and the old row is left in place as history.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo(ledger: freetier::ledger::QuotaLedger) -> freetier::Result<()> {
//! use freetier::identity::{DeviceId, Identity};
//! use freetier::ledger::Feature;
//!
//! let me = Identity::Device(DeviceId::new("3f6c…")?);
//! if ledger.check(&me, Feature::Solve).await?.allowed {
//!     let grant = ledger.consume(&me, Feature::Solve).await?;
//!     println!("{} solves left today", grant.snapshot.remaining.unwrap_or(u32::MAX));
//! }
//! # Ok(())
//! # }
//! ```

pub mod sqlite;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{DayResolver, UsageDay};
use crate::entitlement::{Entitlement, EntitlementGate};
use crate::error::{FreeTierError, Result};
use crate::identity::Identity;

pub use sqlite::SqliteCounterStore;
pub use store::{CounterKey, CounterStore, IncrementOutcome, MemoryCounterStore};

/// A metered product feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// AI solution for a photographed or pasted question.
    #[default]
    Solve,
    /// Generated practice quiz.
    Quiz,
    /// Speech-to-text question dictation.
    Transcribe,
}

impl Feature {
    pub const ALL: [Feature; 3] = [Feature::Solve, Feature::Quiz, Feature::Transcribe];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solve => "solve",
            Self::Quiz => "quiz",
            Self::Transcribe => "transcribe",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = FreeTierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "solve" => Ok(Self::Solve),
            "quiz" => Ok(Self::Quiz),
            "transcribe" => Ok(Self::Transcribe),
            other => Err(FreeTierError::InvalidInput(format!(
                "unknown feature '{other}'"
            ))),
        }
    }
}

/// Free-tier allowance per feature per usage day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyCaps {
    pub solve: u32,
    pub quiz: u32,
    pub transcribe: u32,
}

impl Default for DailyCaps {
    fn default() -> Self {
        Self {
            solve: 5,
            quiz: 5,
            transcribe: 5,
        }
    }
}

impl DailyCaps {
    /// Same cap for every feature.
    pub fn uniform(cap: u32) -> Self {
        Self {
            solve: cap,
            quiz: cap,
            transcribe: cap,
        }
    }

    pub fn for_feature(&self, feature: Feature) -> u32 {
        match feature {
            Feature::Solve => self.solve,
            Feature::Quiz => self.quiz,
            Feature::Transcribe => self.transcribe,
        }
    }
}

/// Point-in-time view of one identity's allowance for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub used: u32,
    /// `None` means unlimited.
    pub remaining: Option<u32>,
    pub cap: u32,
    pub is_premium: bool,
    pub day: UsageDay,
    pub resets_at: DateTime<Utc>,
}

impl UsageSnapshot {
    fn free(used: u32, cap: u32, day: UsageDay, resets_at: DateTime<Utc>) -> Self {
        Self {
            used,
            remaining: Some(cap.saturating_sub(used)),
            cap,
            is_premium: false,
            day,
            resets_at,
        }
    }

    /// Synthetic snapshot for entitlement holders.
    pub fn unlimited(cap: u32, day: UsageDay, resets_at: DateTime<Utc>) -> Self {
        Self {
            used: 0,
            remaining: None,
            cap,
            is_premium: true,
            day,
            resets_at,
        }
    }

    /// Whether one more unit would be accepted.
    pub fn has_allowance(&self) -> bool {
        self.remaining.map_or(true, |r| r > 0)
    }
}

/// Answer to "may this identity perform the feature now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCheck {
    pub allowed: bool,
    pub snapshot: UsageSnapshot,
}

/// Answer to "record that this identity performed the feature".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageGrant {
    /// `false` means the cap was already reached and nothing was recorded.
    pub success: bool,
    pub snapshot: UsageSnapshot,
}

/// Check/consume state machine over a [`CounterStore`].
pub struct QuotaLedger {
    gate: Arc<EntitlementGate>,
    store: Arc<dyn CounterStore>,
    days: DayResolver,
    caps: DailyCaps,
}

impl QuotaLedger {
    pub fn new(
        gate: Arc<EntitlementGate>,
        store: Arc<dyn CounterStore>,
        days: DayResolver,
        caps: DailyCaps,
    ) -> Self {
        Self {
            gate,
            store,
            days,
            caps,
        }
    }

    pub fn gate(&self) -> &Arc<EntitlementGate> {
        &self.gate
    }

    pub fn days(&self) -> &DayResolver {
        &self.days
    }

    pub fn cap(&self, feature: Feature) -> u32 {
        self.caps.for_feature(feature)
    }

    /// Read-only allowance check.
    pub async fn check(&self, identity: &Identity, feature: Feature) -> Result<UsageCheck> {
        let entitlement = self.gate.evaluate(identity).await?;
        self.check_as(identity, feature, entitlement).await
    }

    /// [`Self::check`] with an entitlement decision the caller already holds.
    pub async fn check_as(
        &self,
        identity: &Identity,
        feature: Feature,
        entitlement: Entitlement,
    ) -> Result<UsageCheck> {
        let cap = self.cap(feature);
        let day = self.days.today();
        let resets_at = self.days.next_reset();

        if entitlement.is_unlimited() {
            return Ok(UsageCheck {
                allowed: true,
                snapshot: UsageSnapshot::unlimited(cap, day, resets_at),
            });
        }

        let key = CounterKey::new(identity, feature, day);
        let used = self.store.count(&key).await.inspect_err(|e| {
            warn!(identity = %identity, feature = %feature, error = %e, "Counter read failed");
        })?;
        let snapshot = UsageSnapshot::free(used, cap, day, resets_at);
        Ok(UsageCheck {
            allowed: snapshot.has_allowance(),
            snapshot,
        })
    }

    /// Record one unit of `feature` for `identity` if the cap allows it.
    ///
    /// Exactly one unit is persisted when `success` is `true`; nothing is
    /// persisted otherwise. An `Err` also means nothing was persisted.
    pub async fn consume(&self, identity: &Identity, feature: Feature) -> Result<UsageGrant> {
        let entitlement = self.gate.evaluate(identity).await?;
        self.consume_as(identity, feature, entitlement).await
    }

    /// [`Self::consume`] with an entitlement decision the caller already holds.
    pub async fn consume_as(
        &self,
        identity: &Identity,
        feature: Feature,
        entitlement: Entitlement,
    ) -> Result<UsageGrant> {
        let cap = self.cap(feature);
        let day = self.days.today();
        let resets_at = self.days.next_reset();

        if entitlement.is_unlimited() {
            debug!(identity = %identity, feature = %feature, "Premium usage, not metered");
            return Ok(UsageGrant {
                success: true,
                snapshot: UsageSnapshot::unlimited(cap, day, resets_at),
            });
        }

        let key = CounterKey::new(identity, feature, day);
        let outcome = self.store.try_increment(&key, cap).await.inspect_err(|e| {
            warn!(identity = %identity, feature = %feature, error = %e, "Counter increment failed");
        })?;

        match outcome {
            IncrementOutcome::Granted(used) => {
                debug!(identity = %identity, feature = %feature, %day, used, cap, "Usage recorded");
                Ok(UsageGrant {
                    success: true,
                    snapshot: UsageSnapshot::free(used, cap, day, resets_at),
                })
            }
            IncrementOutcome::Exhausted(used) => {
                info!(identity = %identity, feature = %feature, %day, used, cap, "Daily limit reached");
                Ok(UsageGrant {
                    success: false,
                    snapshot: UsageSnapshot::free(used, cap, day, resets_at),
                })
            }
        }
    }

    /// Per-day counts for the last `days` usage days (today included),
    /// newest first. Days without usage are omitted.
    pub async fn history(
        &self,
        identity: &Identity,
        feature: Feature,
        days: u32,
    ) -> Result<Vec<(UsageDay, u32)>> {
        let mut since = self.days.today();
        for _ in 1..days.max(1) {
            since = since.pred();
        }
        self.store.history(identity, feature, since).await
    }
}

impl fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("days", &self.days)
            .field("caps", &self.caps)
            .finish()
    }
}
