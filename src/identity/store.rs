//! Device id persistence.
//!
//! [`IdentityStore`] is the capability the resolver uses to remember the
//! anonymous device id across sessions. The file store keeps it at
//! `~/.freetier/device.json`; tests use the in-memory store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{FreeTierError, Result};

use super::DeviceId;

/// Load/save capability for the installation's device id.
pub trait IdentityStore: Send + Sync {
    /// The persisted device id, or `None` when this installation has none yet.
    fn load(&self) -> Result<Option<DeviceId>>;

    /// Persist `device` as this installation's id.
    fn save(&self, device: &DeviceId) -> Result<()>;
}

// ============================================================================
// File store
// ============================================================================

#[derive(Serialize, Deserialize)]
struct DeviceFile {
    device_id: String,
    created_at: i64,
}

/// JSON-file backed device id store.
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    /// Store at `<data_dir>/device.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join("device.json"),
        }
    }

    /// Store at a custom path (for testing).
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<DeviceId>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FreeTierError::Io(e)),
        };
        if data.trim().is_empty() {
            return Ok(None);
        }
        // A corrupt file is surfaced rather than replaced so the user can
        // recover the original id by hand.
        let file: DeviceFile = serde_json::from_str(&data).map_err(|e| {
            FreeTierError::Config(format!(
                "Failed to parse device id file {:?}: {}",
                self.path, e
            ))
        })?;
        let device = DeviceId::new(file.device_id).map_err(|e| {
            FreeTierError::Config(format!("Invalid device id in {:?}: {}", self.path, e))
        })?;
        Ok(Some(device))
    }

    fn save(&self, device: &DeviceId) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&DeviceFile {
            device_id: device.as_str().to_string(),
            created_at: chrono::Utc::now().timestamp(),
        })
        .map_err(|e| FreeTierError::Config(format!("Failed to serialize device id: {}", e)))?;

        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }

        Ok(())
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// In-process device id store.
#[derive(Default)]
pub struct MemoryIdentityStore {
    device: Mutex<Option<DeviceId>>,
}

impl MemoryIdentityStore {
    pub fn with_device(device: DeviceId) -> Self {
        Self {
            device: Mutex::new(Some(device)),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<DeviceId>> {
        Ok(self
            .device
            .lock()
            .expect("identity store lock poisoned")
            .clone())
    }

    fn save(&self, device: &DeviceId) -> Result<()> {
        *self.device.lock().expect("identity store lock poisoned") = Some(device.clone());
        Ok(())
    }
}
