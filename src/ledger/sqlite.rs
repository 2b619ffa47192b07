//! SQLite counter store.
//!
//! Safe to share between several server processes pointed at the same
//! database file: the increment is one `INSERT … ON CONFLICT DO UPDATE … WHERE
//! count < cap` statement, so SQLite's write lock serializes the decision and
//! the write together.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::clock::UsageDay;
use crate::error::{FreeTierError, Result};
use crate::identity::Identity;

use super::store::{CounterKey, CounterStore, IncrementOutcome};
use super::Feature;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage_counters (
    identity_kind  TEXT    NOT NULL,
    identity_value TEXT    NOT NULL,
    feature        TEXT    NOT NULL,
    day            TEXT    NOT NULL,
    count          INTEGER NOT NULL CHECK (count >= 0),
    PRIMARY KEY (identity_kind, identity_value, feature, day)
);
";

// `WHERE ?5 > 0` keeps a zero cap from creating a row, and also disambiguates
// the upsert clause from a join constraint on the SELECT.
const INCREMENT: &str = "
INSERT INTO usage_counters (identity_kind, identity_value, feature, day, count)
SELECT ?1, ?2, ?3, ?4, 1 WHERE ?5 > 0
ON CONFLICT (identity_kind, identity_value, feature, day)
DO UPDATE SET count = count + 1 WHERE count < ?5
RETURNING count
";

const SELECT_COUNT: &str = "
SELECT count FROM usage_counters
WHERE identity_kind = ?1 AND identity_value = ?2 AND feature = ?3 AND day = ?4
";

const SELECT_HISTORY: &str = "
SELECT day, count FROM usage_counters
WHERE identity_kind = ?1 AND identity_value = ?2 AND feature = ?3 AND day >= ?4
ORDER BY day DESC
";

/// Counter store backed by a SQLite database.
pub struct SqliteCounterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCounterStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        // WAL lets readers proceed while another process holds the write lock.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(db_err)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Opened SQLite counter store");
        Ok(store)
    }

    /// Private in-memory database (tests, single-shot CLI runs).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite connection lock poisoned");
            f(&guard).map_err(db_err)
        })
        .await
        .map_err(|e| FreeTierError::DependencyUnavailable(format!("counter store task: {e}")))?
    }
}

fn db_err(e: rusqlite::Error) -> FreeTierError {
    FreeTierError::DependencyUnavailable(format!("counter store: {e}"))
}

fn key_params(key: &CounterKey) -> (&'static str, String, &'static str, String) {
    (
        key.kind.as_str(),
        key.identity.clone(),
        key.feature.as_str(),
        key.day.to_string(),
    )
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn count(&self, key: &CounterKey) -> Result<u32> {
        let (kind, identity, feature, day) = key_params(key);
        self.with_conn(move |conn| {
            let count: Option<u32> = conn
                .query_row(SELECT_COUNT, params![kind, identity, feature, day], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(count.unwrap_or(0))
        })
        .await
    }

    async fn try_increment(&self, key: &CounterKey, cap: u32) -> Result<IncrementOutcome> {
        let (kind, identity, feature, day) = key_params(key);
        self.with_conn(move |conn| {
            let granted: Option<u32> = conn
                .query_row(
                    INCREMENT,
                    params![kind, identity, feature, day, cap],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(count) = granted {
                return Ok(IncrementOutcome::Granted(count));
            }
            let current: Option<u32> = conn
                .query_row(SELECT_COUNT, params![kind, identity, feature, day], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(IncrementOutcome::Exhausted(current.unwrap_or(0)))
        })
        .await
    }

    async fn history(
        &self,
        identity: &Identity,
        feature: Feature,
        since: UsageDay,
    ) -> Result<Vec<(UsageDay, u32)>> {
        let kind = identity.kind().as_str();
        let value = identity.value().to_string();
        let feature = feature.as_str();
        let since = since.to_string();
        let raw: Vec<(String, u32)> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(SELECT_HISTORY)?;
                let rows = stmt
                    .query_map(params![kind, value, feature, since], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        raw.into_iter()
            .map(|(day, count)| Ok((UsageDay::parse(&day)?, count)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DeviceId, UserId};
    use tempfile::TempDir;

    fn key(identity: &Identity, day: &str) -> CounterKey {
        CounterKey::new(identity, Feature::Solve, UsageDay::parse(day).unwrap())
    }

    fn device() -> Identity {
        Identity::Device(DeviceId::new("device-a").unwrap())
    }

    #[tokio::test]
    async fn test_increment_until_cap() {
        let store = SqliteCounterStore::in_memory().unwrap();
        let k = key(&device(), "2026-03-01");
        for expected in 1..=3 {
            assert_eq!(
                store.try_increment(&k, 3).await.unwrap(),
                IncrementOutcome::Granted(expected)
            );
        }
        assert_eq!(
            store.try_increment(&k, 3).await.unwrap(),
            IncrementOutcome::Exhausted(3)
        );
        assert_eq!(store.count(&k).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_cap_writes_nothing() {
        let store = SqliteCounterStore::in_memory().unwrap();
        let k = key(&device(), "2026-03-01");
        assert_eq!(
            store.try_increment(&k, 0).await.unwrap(),
            IncrementOutcome::Exhausted(0)
        );
        let history = store
            .history(&device(), Feature::Solve, UsageDay::parse("2000-01-01").unwrap())
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_user_and_device_with_same_value_are_distinct() {
        let store = SqliteCounterStore::in_memory().unwrap();
        let as_user = Identity::User(UserId::new("same").unwrap());
        let as_device = Identity::Device(DeviceId::new("same").unwrap());
        store
            .try_increment(&key(&as_user, "2026-03-01"), 5)
            .await
            .unwrap();
        assert_eq!(store.count(&key(&as_device, "2026-03-01")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_two_connections_share_the_cap() {
        // Two stores on one file model two server instances.
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("counters.db");
        let a = Arc::new(SqliteCounterStore::open(&path).unwrap());
        let b = Arc::new(SqliteCounterStore::open(&path).unwrap());
        let k = key(&device(), "2026-03-01");

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            let k = k.clone();
            tasks.push(tokio::spawn(async move { store.try_increment(&k, 5).await }));
        }
        let mut granted = 0;
        for t in tasks {
            if let IncrementOutcome::Granted(_) = t.await.unwrap().unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        assert_eq!(a.count(&k).await.unwrap(), 5);
        assert_eq!(b.count(&k).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_counts_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("counters.db");
        let k = key(&device(), "2026-03-01");
        {
            let store = SqliteCounterStore::open(&path).unwrap();
            store.try_increment(&k, 5).await.unwrap();
            store.try_increment(&k, 5).await.unwrap();
        }
        let reopened = SqliteCounterStore::open(&path).unwrap();
        assert_eq!(reopened.count(&k).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_history_filters_and_orders() {
        let store = SqliteCounterStore::in_memory().unwrap();
        for day in ["2026-02-20", "2026-03-01", "2026-02-28"] {
            store.try_increment(&key(&device(), day), 5).await.unwrap();
        }
        let rows = store
            .history(&device(), Feature::Solve, UsageDay::parse("2026-02-25").unwrap())
            .await
            .unwrap();
        let days: Vec<String> = rows.iter().map(|(d, _)| d.to_string()).collect();
        assert_eq!(days, vec!["2026-03-01", "2026-02-28"]);
    }
}
