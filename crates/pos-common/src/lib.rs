//! POS Common - Shared types for the multi-tenant POS backend
//!
//! This crate provides the primitives every other tenancy crate speaks:
//! - Shard and tenant identifiers (`ShardId`, `TenantPrefix`, `Namespace`)
//! - The error taxonomy surfaced to controllers (`RouterError`)
//! - Router configuration (`RouterConfig`, `RetryPolicy`)
//! - Lock-free counters for observability
//! - Tracing bootstrap
//!
//! # Placement model
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         TENANTS                              │
//! │   acme    beta    gamma    delta    ...    (prefix, shard)   │
//! └────┬───────┬───────┬────────┬────────────────────────────────┘
//!      │       │       │        │
//! ┌────▼───────▼───────▼────────▼────────────────────────────────┐
//! │   pos_db_1   pos_db_2   pos_db_3   pos_db_4   pos_db_5       │
//! │   acme_products, acme_users, beta_customers, system_users    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod telemetry;

pub use config::{RetryPolicy, RouterConfig};
pub use error::{RouterError, RouterResult};
pub use ids::{Namespace, ShardId, TenantPrefix, MAX_COLLECTION_NAME_LEN};

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counter for observability stats
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Normalize an email or username for lookups and cache keys
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}
