//! Error types for the freetier service.
//!
//! Quota exhaustion is deliberately absent: a rejected `consume` is a normal
//! [`crate::ledger::UsageGrant`] with `success == false`, not an error.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum FreeTierError {
    /// The caller supplied no usable identity, or an unknown feature.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The entitlement store or the counter store could not be reached.
    ///
    /// Callers must treat this as "not consumed" and must never read it as a
    /// premium grant.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Bad configuration file or environment value.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FreeTierError {
    /// Whether the failure is transient and the caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DependencyUnavailable(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FreeTierError>;
