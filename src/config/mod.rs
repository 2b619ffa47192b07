//! Service configuration.
//!
//! Loaded from `~/.freetier/config.json` (or the file named by
//! `FREETIER_CONFIG`), then overridden by `FREETIER_*` environment variables.
//! Every field has a default, so a missing file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FreeTierError, Result};
use crate::ledger::DailyCaps;

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "FREETIER_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Free-tier allowance per feature.
    pub caps: DailyCaps,
    /// Fixed offset from UTC, in minutes, at which the usage day turns over.
    pub utc_offset_minutes: i32,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            caps: DailyCaps::default(),
            utc_offset_minutes: -360,
            cache: CacheConfig::default(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Usage snapshot and entitlement cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window for cached usage snapshots.
    pub ttl_secs: u64,
    /// Freshness window for cached entitlement decisions.
    pub entitlement_ttl_secs: u64,
    /// Maximum number of cached usage snapshots, and of cached entitlement
    /// decisions.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 15,
            entitlement_ttl_secs: 15,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn entitlement_ttl(&self) -> Duration {
        Duration::from_secs(self.entitlement_ttl_secs)
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1).
    pub bind: String,
    pub port: u16,
    /// Origin allowed by CORS. `None` allows any origin.
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9191,
            cors_origin: None,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Backing store locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite counter database. In-memory counters when unset.
    pub database: Option<PathBuf>,
    /// Entitlement file maintained by the billing workflow.
    /// Defaults to `<config dir>/entitlements.json`.
    pub entitlements: Option<PathBuf>,
    /// Directory holding the persisted device id.
    /// Defaults to the config dir.
    pub device_dir: Option<PathBuf>,
}

impl Config {
    /// `~/.freetier`
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".freetier")
    }

    /// Config file path, honoring `FREETIER_CONFIG`.
    pub fn path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::dir().join("config.json"))
    }

    /// Load from the default path and apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load from `path` (or the default path), apply environment overrides
    /// and validate.
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::path);
        let mut config = Self::load_from_path(&path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            FreeTierError::Config(format!("invalid config file {}: {e}", path.display()))
        })
    }

    /// Apply `FREETIER_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "FREETIER_SOLVE_CAP")? {
            self.caps.solve = v;
        }
        if let Some(v) = parse_env(&lookup, "FREETIER_QUIZ_CAP")? {
            self.caps.quiz = v;
        }
        if let Some(v) = parse_env(&lookup, "FREETIER_TRANSCRIBE_CAP")? {
            self.caps.transcribe = v;
        }
        if let Some(v) = parse_env(&lookup, "FREETIER_UTC_OFFSET_MINUTES")? {
            self.utc_offset_minutes = v;
        }
        if let Some(v) = parse_env(&lookup, "FREETIER_CACHE_TTL_SECS")? {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = lookup("FREETIER_BIND").filter(|v| !v.trim().is_empty()) {
            self.server.bind = v.trim().to_string();
        }
        if let Some(v) = parse_env(&lookup, "FREETIER_PORT")? {
            self.server.port = v;
        }
        if let Some(v) = lookup("FREETIER_DATABASE").filter(|v| !v.trim().is_empty()) {
            self.storage.database = Some(PathBuf::from(v.trim()));
        }
        Ok(())
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.utc_offset_minutes.unsigned_abs() >= 24 * 60 {
            return Err(FreeTierError::Config(format!(
                "utc_offset_minutes must be within ±1439, got {}",
                self.utc_offset_minutes
            )));
        }
        if self.cache.ttl_secs == 0 {
            return Err(FreeTierError::Config("cache.ttl_secs must be > 0".into()));
        }
        if self.cache.entitlement_ttl_secs == 0 {
            return Err(FreeTierError::Config(
                "cache.entitlement_ttl_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn entitlements_path(&self) -> PathBuf {
        self.storage
            .entitlements
            .clone()
            .unwrap_or_else(|| Self::dir().join("entitlements.json"))
    }

    pub fn device_dir(&self) -> PathBuf {
        self.storage.device_dir.clone().unwrap_or_else(Self::dir)
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FreeTierError::Config(format!("{key}: cannot parse '{raw}'"))),
    }
}
