//! Login directory cache
//!
//! Maps a normalized email or username to the tenant that owns the user.
//! Purely an accelerator: an empty cache only costs a wider search.

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use pos_common::{normalize_key, AtomicCounter, RouterConfig};
use std::time::Duration;

/// Cached owner of an email/username
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Store id owning the key
    pub tenant_id: String,
    /// When the entry was written
    pub cached_at: DateTime<Utc>,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct DirectoryCacheStats {
    /// Entries currently held
    pub size: u64,
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Configured entry lifetime
    pub ttl_secs: u64,
}

/// TTL cache of user key -> tenant id
pub struct DirectoryCache {
    entries: Cache<String, DirectoryEntry>,
    ttl: Duration,
    hits: AtomicCounter,
    misses: AtomicCounter,
}

impl DirectoryCache {
    /// Cache holding at most `capacity` entries, each for `ttl`
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            ttl,
            hits: AtomicCounter::new(0),
            misses: AtomicCounter::new(0),
        }
    }

    /// Cache sized and timed from configuration
    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(config.directory_cache_ttl(), config.directory_cache_capacity)
    }

    /// Owning tenant, or `None` when absent or expired
    pub fn get(&self, key: &str) -> Option<String> {
        match self.entries.get(&normalize_key(key)) {
            Some(entry) => {
                self.hits.inc();
                Some(entry.tenant_id)
            }
            None => {
                self.misses.inc();
                None
            }
        }
    }

    /// Full entry including insertion time
    pub fn entry(&self, key: &str) -> Option<DirectoryEntry> {
        self.entries.get(&normalize_key(key))
    }

    /// Upsert; a missing or empty tenant is never cached
    pub fn put(&self, key: &str, tenant_id: Option<&str>) {
        let key = normalize_key(key);
        let tenant_id = match tenant_id.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return,
        };
        if key.is_empty() {
            return;
        }

        tracing::trace!(key = %key, tenant = %tenant_id, "Directory cache put");
        self.entries.insert(
            key,
            DirectoryEntry {
                tenant_id,
                cached_at: Utc::now(),
            },
        );
    }

    /// Drop one key; absent keys are ignored
    pub fn invalidate(&self, key: &str) {
        self.entries.invalidate(&normalize_key(key));
    }

    /// Drop both lookup keys of a user
    pub fn invalidate_user(&self, email: Option<&str>, username: Option<&str>) {
        for key in [email, username].into_iter().flatten() {
            self.invalidate(key);
        }
    }

    /// Drop everything
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Hit/miss counters and current size
    pub fn stats(&self) -> DirectoryCacheStats {
        self.entries.run_pending_tasks();
        DirectoryCacheStats {
            size: self.entries.entry_count(),
            hits: self.hits.get(),
            misses: self.misses.get(),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> DirectoryCache {
        DirectoryCache::new(Duration::from_secs(3600), 1_000)
    }

    #[test]
    fn test_put_get() {
        let cache = cache();
        cache.put("user@x.com", Some("acme"));
        assert_eq!(cache.get("user@x.com").as_deref(), Some("acme"));
        assert_eq!(cache.get(" USER@X.com ").as_deref(), Some("acme"));
        assert!(cache.get("other@x.com").is_none());

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.ttl_secs, 3600);
    }

    #[test]
    fn test_empty_tenant_not_cached() {
        let cache = cache();
        cache.put("bob", None);
        cache.put("bob", Some("  "));
        assert!(cache.get("bob").is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let cache = cache();
        cache.put("bob", Some("acme"));
        cache.put("bob", Some("beta"));
        assert_eq!(cache.get("bob").as_deref(), Some("beta"));
    }

    #[test]
    fn test_invalidate() {
        let cache = cache();
        cache.put("bob@x.com", Some("acme"));
        cache.put("bob", Some("acme"));
        cache.invalidate("nobody");
        cache.invalidate_user(Some("Bob@X.com"), Some("bob"));
        assert!(cache.get("bob@x.com").is_none());
        assert!(cache.get("bob").is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = DirectoryCache::new(Duration::from_millis(50), 100);
        cache.put("user@x.com", Some("acme"));
        assert!(cache.get("user@x.com").is_some());
        std::thread::sleep(Duration::from_millis(120));
        assert!(cache.get("user@x.com").is_none());
    }

    #[test]
    fn test_clear() {
        let cache = cache();
        cache.put("a", Some("acme"));
        cache.put("b", Some("beta"));
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }
}
