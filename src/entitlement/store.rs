//! Entitlement record sources.
//!
//! The billing workflow owns these records; this crate only reads them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FreeTierError, Result};
use crate::identity::UserId;

/// Read-only view of the entitlement table.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Whether `user` currently holds the premium entitlement.
    ///
    /// A user without a record is not premium. Transport failures must be
    /// reported as [`FreeTierError::DependencyUnavailable`], never as `false`
    /// or `true`.
    async fn is_premium(&self, user: &UserId) -> Result<bool>;
}

/// One row of the entitlement table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementRecord {
    pub is_premium: bool,
}

// ============================================================================
// Memory store
// ============================================================================

/// In-process entitlement table.
#[derive(Default)]
pub struct MemoryEntitlementStore {
    records: RwLock<HashMap<UserId, EntitlementRecord>>,
    lookups: AtomicUsize,
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_premium(&self, user: &UserId, is_premium: bool) {
        self.records
            .write()
            .expect("entitlement lock poisoned")
            .insert(user.clone(), EntitlementRecord { is_premium });
    }

    /// Number of `is_premium` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn is_premium(&self, user: &UserId) -> Result<bool> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().expect("entitlement lock poisoned");
        Ok(records.get(user).map(|r| r.is_premium).unwrap_or(false))
    }
}

// ============================================================================
// File store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct EntitlementFile {
    #[serde(default)]
    users: HashMap<String, EntitlementRecord>,
}

/// Entitlement table exported by the billing workflow as JSON:
///
/// ```json
/// { "users": { "user-123": { "isPremium": true } } }
/// ```
///
/// The file is re-read on every lookup; the gate's cache bounds how often.
pub struct FileEntitlementStore {
    path: PathBuf,
}

impl FileEntitlementStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl EntitlementStore for FileEntitlementStore {
    async fn is_premium(&self, user: &UserId) -> Result<bool> {
        let data = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            FreeTierError::DependencyUnavailable(format!(
                "entitlement file {:?} unreadable: {}",
                self.path, e
            ))
        })?;
        let file: EntitlementFile = serde_json::from_str(&data).map_err(|e| {
            FreeTierError::DependencyUnavailable(format!(
                "entitlement file {:?} is corrupt: {}",
                self.path, e
            ))
        })?;
        Ok(file
            .users
            .get(user.as_str())
            .map(|r| r.is_premium)
            .unwrap_or(false))
    }
}
