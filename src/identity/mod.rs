//! Caller identity resolution.
//!
//! A request is metered either against a verified user id or, for anonymous
//! callers, against a device id generated once per installation and kept in
//! an [`IdentityStore`].

pub mod store;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FreeTierError, Result};

pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore};

/// Server-verified user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Locally generated, client-persisted device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

macro_rules! id_newtype {
    ($ty:ident, $label:literal) => {
        impl $ty {
            /// Wrap a raw identifier. Blank values are rejected.
            pub fn new(raw: impl Into<String>) -> Result<Self> {
                let raw = raw.into();
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(FreeTierError::InvalidInput(format!(
                        "{} must not be blank",
                        $label
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId, "user id");
id_newtype!(DeviceId, "device id");

impl DeviceId {
    /// Fresh random device id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Kind tag stored alongside the identity value in the counter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    User,
    Device,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Device => "device",
        }
    }
}

/// The identity a request is metered against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(UserId),
    Device(DeviceId),
}

impl Identity {
    /// Build an identity from optional request fields.
    ///
    /// A non-blank user id always wins over the device id. Supplying neither
    /// is a caller error.
    pub fn from_parts(user_id: Option<&str>, device_id: Option<&str>) -> Result<Self> {
        if let Some(user) = user_id.and_then(|u| UserId::new(u).ok()) {
            return Ok(Self::User(user));
        }
        if let Some(device) = device_id.and_then(|d| DeviceId::new(d).ok()) {
            return Ok(Self::Device(device));
        }
        Err(FreeTierError::InvalidInput(
            "either userId or deviceId is required".to_string(),
        ))
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::User(_) => IdentityKind::User,
            Self::Device(_) => IdentityKind::Device,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::User(id) => id.as_str(),
            Self::Device(id) => id.as_str(),
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Self::User(id) => Some(id),
            Self::Device(_) => None,
        }
    }
}

/// `kind:value`, with device ids shortened to keep logs readable.
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Device(id) => {
                let s = id.as_str();
                let short = s.get(..8).unwrap_or(s);
                write!(f, "device:{short}")
            }
        }
    }
}

/// Resolves the active identity for this installation.
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// Return the user identity when authenticated, else the device identity.
    ///
    /// The device id is generated and persisted on first use. A store read
    /// failure is returned as-is: generating a replacement id would orphan the
    /// installation's existing counters.
    pub fn resolve(&self, authenticated: Option<UserId>) -> Result<Identity> {
        if let Some(user) = authenticated {
            return Ok(Identity::User(user));
        }
        Ok(Identity::Device(self.device_id()?))
    }

    /// The persisted device id, creating it if this installation has none.
    pub fn device_id(&self) -> Result<DeviceId> {
        if let Some(existing) = self.store.load()? {
            debug!(device = %Identity::Device(existing.clone()), "Loaded persisted device id");
            return Ok(existing);
        }
        let fresh = DeviceId::generate();
        self.store.save(&fresh)?;
        info!(device = %Identity::Device(fresh.clone()), "Generated new device id");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_from_parts_prefers_user() {
        let id = Identity::from_parts(Some("u-1"), Some("d-1")).unwrap();
        assert_eq!(id, Identity::User(UserId::new("u-1").unwrap()));
        assert_eq!(id.kind(), IdentityKind::User);
    }

    #[test]
    fn test_from_parts_falls_back_to_device() {
        let id = Identity::from_parts(None, Some("d-1")).unwrap();
        assert_eq!(id.kind(), IdentityKind::Device);
        assert_eq!(id.value(), "d-1");
        assert!(id.user_id().is_none());
    }

    #[test]
    fn test_from_parts_blank_user_falls_back_to_device() {
        let id = Identity::from_parts(Some("   "), Some("d-1")).unwrap();
        assert_eq!(id.kind(), IdentityKind::Device);
    }

    #[test]
    fn test_from_parts_none_is_invalid_input() {
        let err = Identity::from_parts(None, None).unwrap_err();
        assert!(matches!(err, FreeTierError::InvalidInput(_)), "{err:?}");
        let err = Identity::from_parts(Some(""), Some(" ")).unwrap_err();
        assert!(matches!(err, FreeTierError::InvalidInput(_)), "{err:?}");
    }

    #[test]
    fn test_ids_are_trimmed() {
        assert_eq!(UserId::new("  abc ").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_display_truncates_device() {
        let id = Identity::Device(DeviceId::new("0123456789abcdef").unwrap());
        assert_eq!(id.to_string(), "device:01234567");
        let user = Identity::User(UserId::new("alice").unwrap());
        assert_eq!(user.to_string(), "user:alice");
    }

    #[test]
    fn test_resolve_authenticated_skips_store() {
        let store = Arc::new(MemoryIdentityStore::default());
        let resolver = IdentityResolver::new(store.clone());
        let id = resolver
            .resolve(Some(UserId::new("alice").unwrap()))
            .unwrap();
        assert_eq!(id.kind(), IdentityKind::User);
        assert!(store.load().unwrap().is_none(), "no device id should be minted");
    }

    #[test]
    fn test_resolve_anonymous_is_stable() {
        let resolver = IdentityResolver::new(Arc::new(MemoryIdentityStore::default()));
        let first = resolver.resolve(None).unwrap();
        let second = resolver.resolve(None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.kind(), IdentityKind::Device);
    }

    #[test]
    fn test_resolve_reuses_preexisting_device_id() {
        let store = Arc::new(MemoryIdentityStore::with_device(
            DeviceId::new("persisted-device").unwrap(),
        ));
        let resolver = IdentityResolver::new(store);
        assert_eq!(resolver.resolve(None).unwrap().value(), "persisted-device");
    }

    /// A store whose reads always fail.
    struct BrokenStore {
        saves: AtomicUsize,
    }

    impl IdentityStore for BrokenStore {
        fn load(&self) -> Result<Option<DeviceId>> {
            Err(FreeTierError::Io(std::io::Error::other("disk gone")))
        }

        fn save(&self, _device: &DeviceId) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_load_failure_does_not_mint_new_id() {
        let store = Arc::new(BrokenStore {
            saves: AtomicUsize::new(0),
        });
        let resolver = IdentityResolver::new(store.clone());
        assert!(resolver.resolve(None).is_err());
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }
}
