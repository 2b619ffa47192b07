//! freetier: daily free-tier quota and premium entitlement service.
//!
//! Each metered feature (solve, quiz, transcribe) has a small daily allowance
//! per identity. The allowance resets at a fixed-offset day boundary, premium
//! users are never metered, and every accepted use is counted exactly once
//! even under concurrent requests.
//!
//! Request flow: [`identity`] → [`entitlement`] → [`ledger`], with the
//! [`cache`] layer in front for repeated checks and [`api`] as the HTTP
//! boundary.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod metrics;

pub use error::{FreeTierError, Result};
