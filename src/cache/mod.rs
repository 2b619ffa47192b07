//! Caller-side usage caching: a TTL/LRU snapshot cache and the client that
//! wraps the ledger with it.

pub mod client;
pub mod usage_cache;

pub use client::UsageClient;
pub use usage_cache::{CacheStats, UsageCache};
