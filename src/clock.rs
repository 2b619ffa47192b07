//! Usage-day boundary resolution.
//!
//! Free-tier counters reset at midnight in a fixed reference offset (UTC−6
//! by default), never at the caller's local midnight. [`DayResolver`] turns
//! the current instant into the canonical [`UsageDay`] so every server
//! instance agrees on which counter row is live.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use freetier::clock::{DayResolver, ManualClock};
//!
//! // 03:00 UTC on March 2nd is still March 1st at UTC−6.
//! let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap()));
//! let resolver = DayResolver::new(clock, -360).unwrap();
//! assert_eq!(resolver.today().to_string(), "2026-03-01");
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FreeTierError, Result};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to simulate day rollover.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().expect("manual clock lock poisoned") = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().expect("manual clock lock poisoned");
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock lock poisoned")
    }
}

/// Calendar day a usage counter belongs to.
///
/// Serialized as `"YYYY-MM-DD"`, which is also the key stored in the
/// counter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageDay(NaiveDate);

impl UsageDay {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// The previous calendar day, saturating at the minimum date.
    pub fn pred(&self) -> Self {
        Self(self.0.pred_opt().unwrap_or(self.0))
    }

    /// Parse a `"YYYY-MM-DD"` key.
    pub fn parse(key: &str) -> Result<Self> {
        NaiveDate::parse_from_str(key, "%Y-%m-%d")
            .map(Self)
            .map_err(|e| FreeTierError::InvalidInput(format!("bad usage day '{key}': {e}")))
    }
}

impl fmt::Display for UsageDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Maps instants onto usage days under a fixed UTC offset.
#[derive(Clone)]
pub struct DayResolver {
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl DayResolver {
    /// Build a resolver for `utc_offset_minutes` (negative is west of UTC).
    ///
    /// Offsets of a full day or more are rejected.
    pub fn new(clock: Arc<dyn Clock>, utc_offset_minutes: i32) -> Result<Self> {
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                FreeTierError::Config(format!(
                    "utc offset {utc_offset_minutes} minutes is out of range"
                ))
            })?;
        Ok(Self { clock, offset })
    }

    /// Resolver on the wall clock.
    pub fn system(utc_offset_minutes: i32) -> Result<Self> {
        Self::new(Arc::new(SystemClock), utc_offset_minutes)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// The current usage day.
    pub fn today(&self) -> UsageDay {
        self.day_of(self.clock.now())
    }

    /// The usage day an arbitrary instant falls into.
    pub fn day_of(&self, instant: DateTime<Utc>) -> UsageDay {
        UsageDay(instant.with_timezone(&self.offset).date_naive())
    }

    /// UTC instant at which the current usage day ends.
    pub fn next_reset(&self) -> DateTime<Utc> {
        let today = self.today().date();
        let tomorrow = today.succ_opt().unwrap_or(today);
        let local_midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default();
        // Fixed offsets have no gaps, so the local wall time maps to exactly one instant.
        let utc_naive = local_midnight - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(utc_naive, Utc)
    }
}

impl fmt::Debug for DayResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DayResolver")
            .field("offset", &self.offset)
            .finish()
    }
}
