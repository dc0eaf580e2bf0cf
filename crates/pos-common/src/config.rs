//! Router configuration

use crate::error::{RouterError, RouterResult};
use crate::ids::ShardId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the base connection string
pub const ENV_BASE_URI: &str = "MONGODB_URI";
/// Environment variable overriding the database name prefix
pub const ENV_DATABASE_PREFIX: &str = "DATABASE_PREFIX";
/// Environment variable overriding the shard count
pub const ENV_SHARD_COUNT: &str = "SHARD_COUNT";
/// Environment variable overriding the shard that hosts system collections
pub const ENV_SYSTEM_SHARD: &str = "SYSTEM_SHARD";
/// Environment variable overriding the directory cache TTL
pub const ENV_DIRECTORY_CACHE_TTL: &str = "DIRECTORY_CACHE_TTL_SECS";

/// Retry policy for transient connection failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub initial_backoff_ms: u64,
}

impl RetryPolicy {
    /// Backoff to wait after the given failed attempt (1-based).
    ///
    /// Attempt 1 → initial, attempt 2 → 2×initial, attempt 3 → 4×initial.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(1u64 << exp))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
        }
    }
}

/// Tenancy router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Base connection string; its database path segment is substituted per shard
    pub base_uri: String,
    /// Database name prefix; shard k is `{database_prefix}_{k}`
    pub database_prefix: String,
    /// Number of shards (N)
    pub shard_count: u16,
    /// Shard hosting the system and default namespaces and the store registry
    pub system_shard: u16,
    /// Server selection timeout (seconds)
    pub server_selection_timeout_secs: u64,
    /// Socket timeout (seconds)
    pub socket_timeout_secs: u64,
    /// Connection retry policy
    pub retry: RetryPolicy,
    /// Directory cache entry lifetime (seconds)
    pub directory_cache_ttl_secs: u64,
    /// Directory cache capacity (entries)
    pub directory_cache_capacity: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_uri: String::new(),
            database_prefix: "pos_db".into(),
            shard_count: 5,
            system_shard: 1,
            server_selection_timeout_secs: 30,
            socket_timeout_secs: 60,
            retry: RetryPolicy::default(),
            directory_cache_ttl_secs: 3600,
            directory_cache_capacity: 100_000,
        }
    }
}

impl RouterConfig {
    /// Default configuration with the given base connection string
    pub fn with_base_uri(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
            ..Self::default()
        }
    }

    /// Build from environment variables
    pub fn from_env() -> RouterResult<Self> {
        let base_uri = std::env::var(ENV_BASE_URI).map_err(|_| {
            RouterError::Configuration(format!("{} is not set", ENV_BASE_URI))
        })?;

        let mut config = Self::with_base_uri(base_uri);
        if let Ok(prefix) = std::env::var(ENV_DATABASE_PREFIX) {
            config.database_prefix = prefix;
        }
        if let Ok(raw) = std::env::var(ENV_SHARD_COUNT) {
            config.shard_count = parse_env(ENV_SHARD_COUNT, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_SYSTEM_SHARD) {
            config.system_shard = parse_env(ENV_SYSTEM_SHARD, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_DIRECTORY_CACHE_TTL) {
            config.directory_cache_ttl_secs = parse_env(ENV_DIRECTORY_CACHE_TTL, &raw)?;
        }

        config.validate()?;
        tracing::debug!(
            shards = config.shard_count,
            database_prefix = %config.database_prefix,
            "Router configuration loaded from environment"
        );
        Ok(config)
    }

    /// Load from JSON file
    pub fn load(path: &str) -> RouterResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::Configuration(format!("reading {}: {}", path, e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RouterError::Configuration(format!("parsing {}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to JSON file
    pub fn save(&self, path: &str) -> RouterResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RouterError::Configuration(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| RouterError::Configuration(format!("writing {}: {}", path, e)))
    }

    /// Check settings that would make every shard unusable
    pub fn validate(&self) -> RouterResult<()> {
        if self.base_uri.trim().is_empty() {
            return Err(RouterError::Configuration("base connection string is empty".into()));
        }
        if self.database_prefix.trim().is_empty() {
            return Err(RouterError::Configuration("database prefix is empty".into()));
        }
        if self.shard_count == 0 {
            return Err(RouterError::Configuration("shard count must be at least 1".into()));
        }
        if self.system_shard == 0 || self.system_shard > self.shard_count {
            return Err(RouterError::Configuration(format!(
                "system shard {} out of range [1, {}]",
                self.system_shard, self.shard_count
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(RouterError::Configuration("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Shard hosting system/default collections
    pub fn system_shard_id(&self) -> ShardId {
        ShardId::from_raw(self.system_shard)
    }

    /// Database name for a shard
    pub fn database_name(&self, shard: ShardId) -> String {
        format!("{}_{}", self.database_prefix, shard.get())
    }

    /// Server selection timeout
    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_secs(self.server_selection_timeout_secs)
    }

    /// Socket timeout
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    /// Directory cache TTL
    pub fn directory_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.directory_cache_ttl_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> RouterResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| RouterError::Configuration(format!("{} has invalid value '{}'", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(4));
    }

    #[test]
    fn test_validate() {
        assert!(RouterConfig::default().validate().is_err());

        let config = RouterConfig::with_base_uri("mongodb://localhost:27017/pos");
        assert!(config.validate().is_ok());
        assert_eq!(config.shard_count, 5);
        assert_eq!(config.directory_cache_ttl(), Duration::from_secs(3600));

        let mut bad = config.clone();
        bad.system_shard = 6;
        assert!(matches!(bad.validate(), Err(RouterError::Configuration(_))));

        let mut bad = config;
        bad.shard_count = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_database_name() {
        let config = RouterConfig::with_base_uri("mongodb://localhost");
        assert_eq!(config.database_name(ShardId::from_raw(3)), "pos_db_3");
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("pos-router-{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();

        let mut config = RouterConfig::with_base_uri("mongodb://db.internal:27017/?retryWrites=true");
        config.shard_count = 3;
        config.save(&path).unwrap();

        let loaded = RouterConfig::load(&path).unwrap();
        assert_eq!(loaded.shard_count, 3);
        assert_eq!(loaded.base_uri, config.base_uri);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            RouterConfig::load("/nonexistent/pos-router.json"),
            Err(RouterError::Configuration(_))
        ));
    }
}
