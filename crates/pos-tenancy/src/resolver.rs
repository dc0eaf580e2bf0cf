//! Tenant resolution
//!
//! Maps a raw tenant identifier (store id or prefix, any case) to the
//! canonical prefix and the shard that hosts it.

use crate::placement::least_loaded_shard;
use crate::stores::{StoreRegistry, TenantRecord};
use pos_common::{RouterError, RouterResult, ShardId, TenantPrefix};
use std::sync::Arc;

/// Where a tenant's collections live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantPlacement {
    /// Canonical prefix
    pub prefix: TenantPrefix,
    /// Hosting shard; `None` when the identifier was only syntactically valid
    pub shard_id: Option<ShardId>,
    /// Registry store id, when a record exists
    pub store_id: Option<String>,
}

impl TenantPlacement {
    /// Shard id, or `NotFound` for unregistered tenants
    pub fn require_shard(&self) -> RouterResult<ShardId> {
        self.shard_id.ok_or_else(|| {
            RouterError::not_found(format!("tenant '{}' has no registered shard", self.prefix))
        })
    }

    /// Whether the placement came from a registry record
    pub fn is_registered(&self) -> bool {
        self.store_id.is_some()
    }
}

impl From<&TenantRecord> for TenantPlacement {
    fn from(record: &TenantRecord) -> Self {
        Self {
            prefix: record.prefix.clone(),
            shard_id: Some(record.shard_id),
            store_id: Some(record.store_id.clone()),
        }
    }
}

/// Tenant resolver
pub struct TenantResolver {
    registry: Arc<dyn StoreRegistry>,
    shard_count: u16,
}

impl TenantResolver {
    /// Resolver over `registry` for a deployment of `shard_count` shards
    pub fn new(registry: Arc<dyn StoreRegistry>, shard_count: u16) -> Self {
        Self { registry, shard_count }
    }

    /// Underlying store registry
    pub fn registry(&self) -> &Arc<dyn StoreRegistry> {
        &self.registry
    }

    /// Resolve by prefix, then by store id, then as a bare prefix.
    ///
    /// Registry failures propagate unchanged; retrying is the shard
    /// registry's job.
    pub async fn resolve(&self, raw_tenant: &str) -> RouterResult<TenantPlacement> {
        let normalized = raw_tenant.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(RouterError::not_found("empty tenant identifier"));
        }

        if let Some(record) = self.registry.find_by_prefix(&normalized).await? {
            return self.placement(&record);
        }
        if let Some(record) = self.registry.find_by_store_id(&normalized).await? {
            return self.placement(&record);
        }

        if TenantPrefix::is_valid(&normalized) {
            tracing::debug!(tenant = %normalized, "Tenant not registered, using identifier as prefix");
            return Ok(TenantPlacement {
                prefix: TenantPrefix::parse(&normalized)?,
                shard_id: None,
                store_id: None,
            });
        }

        Err(RouterError::not_found(format!("tenant '{}'", raw_tenant.trim())))
    }

    /// Resolve and require a registered shard
    pub async fn resolve_with_shard(&self, raw_tenant: &str) -> RouterResult<(TenantPlacement, ShardId)> {
        let placement = self.resolve(raw_tenant).await?;
        let shard = placement.require_shard()?;
        Ok((placement, shard))
    }

    fn placement(&self, record: &TenantRecord) -> RouterResult<TenantPlacement> {
        ShardId::new(record.shard_id.get(), self.shard_count)?;
        Ok(TenantPlacement::from(record))
    }

    /// Register a new store on the least-loaded shard
    pub async fn register_tenant(
        &self,
        store_id: &str,
        prefix: &str,
        name: Option<&str>,
    ) -> RouterResult<TenantRecord> {
        let prefix = TenantPrefix::parse(&prefix.trim().to_lowercase())?;
        if self.registry.find_by_prefix(prefix.as_str()).await?.is_some() {
            return Err(RouterError::Conflict(format!("prefix '{}' already registered", prefix)));
        }

        let existing = self.registry.list_all().await?;
        let shard = least_loaded_shard(&existing, self.shard_count);
        self.register_on_shard(store_id, prefix, shard, name).await
    }

    /// Register a new store on an explicit shard
    pub async fn register_tenant_on(
        &self,
        store_id: &str,
        prefix: &str,
        shard: ShardId,
        name: Option<&str>,
    ) -> RouterResult<TenantRecord> {
        let prefix = TenantPrefix::parse(&prefix.trim().to_lowercase())?;
        ShardId::new(shard.get(), self.shard_count)?;
        self.register_on_shard(store_id, prefix, shard, name).await
    }

    async fn register_on_shard(
        &self,
        store_id: &str,
        prefix: TenantPrefix,
        shard: ShardId,
        name: Option<&str>,
    ) -> RouterResult<TenantRecord> {
        let mut record = TenantRecord::new(store_id.trim(), prefix, shard);
        if let Some(name) = name {
            record = record.with_name(name);
        }
        self.registry.insert(record.clone()).await?;

        tracing::info!(
            store_id = %record.store_id,
            prefix = %record.prefix,
            shard_id = %record.shard_id,
            "Registered tenant"
        );
        Ok(record)
    }

    /// Move a tenant to another shard (registry only; data moves separately)
    pub async fn reassign_shard(&self, raw_tenant: &str, shard: ShardId) -> RouterResult<TenantRecord> {
        ShardId::new(shard.get(), self.shard_count)?;
        let placement = self.resolve(raw_tenant).await?;
        let store_id = placement
            .store_id
            .ok_or_else(|| RouterError::not_found(format!("tenant '{}' is not registered", raw_tenant)))?;

        let record = self.registry.update_shard(&store_id, shard).await?;
        tracing::warn!(
            store_id = %record.store_id,
            shard_id = %shard,
            "Tenant reassigned to new shard"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryStoreRegistry;

    fn resolver() -> (Arc<InMemoryStoreRegistry>, TenantResolver) {
        let registry = Arc::new(InMemoryStoreRegistry::with_records(vec![
            TenantRecord::new("ST-ACME", TenantPrefix::parse("acme").unwrap(), ShardId::from_raw(1)),
            TenantRecord::new("st-beta", TenantPrefix::parse("beta").unwrap(), ShardId::from_raw(2)),
        ]));
        (registry.clone(), TenantResolver::new(registry, 5))
    }

    #[tokio::test]
    async fn test_resolve_by_prefix_case_insensitive() {
        let (_, resolver) = resolver();
        let placement = resolver.resolve("  ACME ").await.unwrap();
        assert_eq!(placement.prefix.as_str(), "acme");
        assert_eq!(placement.shard_id, Some(ShardId::from_raw(1)));
        assert_eq!(placement.store_id.as_deref(), Some("ST-ACME"));
    }

    #[tokio::test]
    async fn test_resolve_by_store_id() {
        let (_, resolver) = resolver();
        let placement = resolver.resolve("st-acme").await.unwrap();
        assert_eq!(placement.prefix.as_str(), "acme");

        let (placement, shard) = resolver.resolve_with_shard("ST-BETA").await.unwrap();
        assert_eq!(placement.prefix.as_str(), "beta");
        assert_eq!(shard.get(), 2);
    }

    #[tokio::test]
    async fn test_fallback_prefix_has_no_shard() {
        let (_, resolver) = resolver();
        let placement = resolver.resolve("gamma").await.unwrap();
        assert_eq!(placement.prefix.as_str(), "gamma");
        assert!(placement.shard_id.is_none());
        assert!(!placement.is_registered());

        let err = resolver.resolve_with_shard("gamma").await.unwrap_err();
        assert!(matches!(err, RouterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unresolvable() {
        let (_, resolver) = resolver();
        assert!(matches!(resolver.resolve("no such-store!").await, Err(RouterError::NotFound(_))));
        assert!(matches!(resolver.resolve("   ").await, Err(RouterError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_registry_outage_propagates() {
        let (registry, resolver) = resolver();
        registry.set_unreachable(true);
        let err = resolver.resolve("acme").await.unwrap_err();
        assert!(err.is_service_unavailable());
    }

    #[tokio::test]
    async fn test_register_uses_least_loaded_shard() {
        let (_, resolver) = resolver();
        let record = resolver.register_tenant("st-gamma", "Gamma", Some("Gamma Mart")).await.unwrap();
        assert_eq!(record.prefix.as_str(), "gamma");
        assert_eq!(record.shard_id.get(), 3);

        let dup = resolver.register_tenant("st-other", "gamma", None).await.unwrap_err();
        assert!(matches!(dup, RouterError::Conflict(_)));

        let bad = resolver.register_tenant("st-bad", "Acme!", None).await.unwrap_err();
        assert!(matches!(bad, RouterError::Validation(_)));
    }

    #[tokio::test]
    async fn test_reassign_shard() {
        let (_, resolver) = resolver();
        let record = resolver.reassign_shard("beta", ShardId::from_raw(5)).await.unwrap();
        assert_eq!(record.shard_id.get(), 5);
        assert_eq!(resolver.resolve("beta").await.unwrap().shard_id, Some(ShardId::from_raw(5)));

        assert!(resolver.reassign_shard("beta", ShardId::from_raw(6)).await.is_err());
        assert!(resolver.reassign_shard("unregistered", ShardId::from_raw(2)).await.is_err());
    }
}
