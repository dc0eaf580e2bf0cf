//! Shard and tenant identifiers

use crate::error::{RouterError, RouterResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Longest collection name a shard database accepts
pub const MAX_COLLECTION_NAME_LEN: usize = 255;

fn prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+$").expect("static prefix pattern"))
}

/// Physical shard identifier, always within `[1, N]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u16);

impl ShardId {
    /// Validate `raw` against the configured shard count
    pub fn new(raw: u16, shard_count: u16) -> RouterResult<Self> {
        if raw == 0 || raw > shard_count {
            return Err(RouterError::validation(format!(
                "shard id {} out of range [1, {}]",
                raw, shard_count
            )));
        }
        Ok(Self(raw))
    }

    /// Wrap a raw id without range checking.
    ///
    /// Only for ids that already passed through [`ShardId::new`], e.g. values
    /// read back from a registry record that was validated on write.
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw numeric id
    pub fn get(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical tenant prefix, lowercase `[a-z0-9_]+`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantPrefix(String);

impl TenantPrefix {
    /// Parse an already-normalized prefix
    pub fn parse(raw: &str) -> RouterResult<Self> {
        if !Self::is_valid(raw) {
            return Err(RouterError::validation(format!(
                "invalid tenant prefix '{}': must match ^[a-z0-9_]+$",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Check syntax without allocating
    pub fn is_valid(raw: &str) -> bool {
        prefix_pattern().is_match(raw)
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantPrefix {
    type Error = RouterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantPrefix> for String {
    fn from(value: TenantPrefix) -> Self {
        value.0
    }
}

/// Collection namespace a handle is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Tenant-less administrators (`system_users`)
    System,
    /// Legacy un-prefixed collections (`products`, `categories`, `units`)
    Default,
    /// A store's own collections (`{prefix}_{entity}`)
    Tenant(TenantPrefix),
}

impl Namespace {
    /// Short label for logs
    pub fn label(&self) -> &str {
        match self {
            Self::System => "system",
            Self::Default => "default",
            Self::Tenant(prefix) => prefix.as_str(),
        }
    }

    /// Whether this is a store namespace
    pub fn is_tenant(&self) -> bool {
        matches!(self, Self::Tenant(_))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_bounds() {
        assert!(ShardId::new(0, 5).is_err());
        assert!(ShardId::new(6, 5).is_err());
        assert_eq!(ShardId::new(1, 5).unwrap().get(), 1);
        assert_eq!(ShardId::new(5, 5).unwrap().get(), 5);
    }

    #[test]
    fn test_prefix_validation() {
        assert!(TenantPrefix::parse("acme").is_ok());
        assert!(TenantPrefix::parse("store_42").is_ok());
        assert!(matches!(TenantPrefix::parse("Acme!"), Err(RouterError::Validation(_))));
        assert!(TenantPrefix::parse("").is_err());
        assert!(TenantPrefix::parse("has space").is_err());
    }

    #[test]
    fn test_prefix_serde_rejects_invalid() {
        let ok: TenantPrefix = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.as_str(), "acme");
        assert!(serde_json::from_str::<TenantPrefix>("\"ACME\"").is_err());
    }

    #[test]
    fn test_namespace_labels() {
        let tenant = Namespace::Tenant(TenantPrefix::parse("beta").unwrap());
        assert_eq!(tenant.label(), "beta");
        assert!(tenant.is_tenant());
        assert_eq!(Namespace::System.to_string(), "system");
        assert!(!Namespace::Default.is_tenant());
    }
}
