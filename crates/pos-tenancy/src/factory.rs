//! Model factory
//!
//! Resolves `(namespace, shard, entity kind)` to a shared
//! [`CollectionHandle`]. Handles are cached per `(shard, collection)` and
//! created at most once, even under concurrent first access.

use crate::handle::CollectionHandle;
use crate::resolver::{TenantPlacement, TenantResolver};
use crate::schema::EntityKind;
use crate::shard::ShardRegistry;
use moka::future::Cache;
use pos_common::{AtomicCounter, Namespace, RouterError, RouterResult, ShardId, TenantPrefix};
use std::sync::Arc;

/// Handle cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    /// Shard hosting the collection
    pub shard_id: ShardId,
    /// Full collection name
    pub collection: String,
}

/// Factory counters
#[derive(Debug, Clone, Default)]
pub struct ModelFactoryStats {
    /// Handles currently cached
    pub cached_handles: u64,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that had to open or wait for a handle
    pub misses: u64,
    /// Collections actually opened
    pub creations: u64,
    /// Cached handles dropped because their connection was replaced
    pub reopened: u64,
}

/// Model factory
pub struct ModelFactory {
    shards: Arc<ShardRegistry>,
    resolver: Arc<TenantResolver>,
    handles: Cache<HandleKey, Arc<CollectionHandle>>,
    hits: AtomicCounter,
    misses: AtomicCounter,
    creations: Arc<AtomicCounter>,
    reopened: AtomicCounter,
}

impl ModelFactory {
    /// Factory over a shard registry and tenant resolver
    pub fn new(shards: Arc<ShardRegistry>, resolver: Arc<TenantResolver>) -> Self {
        Self {
            shards,
            resolver,
            handles: Cache::builder().build(),
            hits: AtomicCounter::new(0),
            misses: AtomicCounter::new(0),
            creations: Arc::new(AtomicCounter::new(0)),
            reopened: AtomicCounter::new(0),
        }
    }

    /// Shard registry in use
    pub fn shards(&self) -> &Arc<ShardRegistry> {
        &self.shards
    }

    /// Tenant resolver in use
    pub fn resolver(&self) -> &Arc<TenantResolver> {
        &self.resolver
    }

    /// Handle for `prefix`'s `kind` collection on `shard`
    pub async fn get_handle(
        &self,
        prefix: &str,
        shard: ShardId,
        kind: EntityKind,
    ) -> RouterResult<Arc<CollectionHandle>> {
        let prefix = TenantPrefix::parse(prefix)?;
        self.handle_for(Namespace::Tenant(prefix), shard, kind).await
    }

    /// Handle for any namespace on `shard`
    pub async fn handle_for(
        &self,
        namespace: Namespace,
        shard: ShardId,
        kind: EntityKind,
    ) -> RouterResult<Arc<CollectionHandle>> {
        let collection = kind.collection_name(&namespace)?;
        let connection = self.shards.connection_for(shard).await?;
        let key = HandleKey {
            shard_id: shard,
            collection,
        };

        if let Some(handle) = self.handles.get(&key).await {
            if handle.opened_on(&connection) {
                self.hits.inc();
                return Ok(handle);
            }
            // Shard was reconnected since the handle was opened
            self.reopened.inc();
            tracing::debug!(shard_id = %shard, collection = %key.collection, "Reopening handle on new connection");
            self.handles.invalidate(&key).await;
        }

        self.misses.inc();
        let creations = self.creations.clone();
        let handle = self
            .handles
            .try_get_with(key.clone(), async move {
                let handle = CollectionHandle::open(connection, namespace, kind).await?;
                creations.inc();
                tracing::debug!(
                    shard_id = %handle.shard_id(),
                    collection = %handle.name(),
                    namespace = %handle.namespace(),
                    "Created collection handle"
                );
                Ok::<_, RouterError>(Arc::new(handle))
            })
            .await
            .map_err(|e| (*e).clone())?;
        Ok(handle)
    }

    /// Resolve `tenant` and return its `kind` handle
    pub async fn get_handle_for_tenant(
        &self,
        tenant: &str,
        kind: EntityKind,
    ) -> RouterResult<Arc<CollectionHandle>> {
        let (placement, shard) = self.resolver.resolve_with_shard(tenant).await?;
        self.get_handle_for_placement(&placement, shard, kind).await
    }

    pub(crate) async fn get_handle_for_placement(
        &self,
        placement: &TenantPlacement,
        shard: ShardId,
        kind: EntityKind,
    ) -> RouterResult<Arc<CollectionHandle>> {
        self.handle_for(Namespace::Tenant(placement.prefix.clone()), shard, kind)
            .await
    }

    /// Un-prefixed legacy collection on the system shard
    pub async fn get_default_handle(&self, kind: EntityKind) -> RouterResult<Arc<CollectionHandle>> {
        let shard = self.shards.config().system_shard_id();
        self.handle_for(Namespace::Default, shard, kind).await
    }

    /// Tenant handle, or the default namespace when no tenant is given
    pub async fn get_handle_for_optional_tenant(
        &self,
        tenant: Option<&str>,
        kind: EntityKind,
    ) -> RouterResult<Arc<CollectionHandle>> {
        match tenant.map(str::trim).filter(|t| !t.is_empty()) {
            Some(tenant) => self.get_handle_for_tenant(tenant, kind).await,
            None => self.get_default_handle(kind).await,
        }
    }

    /// Drop every cached handle; later lookups reopen collections
    pub async fn clear_cache(&self) {
        self.handles.invalidate_all();
        self.handles.run_pending_tasks().await;
        tracing::info!("Model handle cache cleared");
    }

    /// Number of cached handles
    pub async fn cached_count(&self) -> u64 {
        self.handles.run_pending_tasks().await;
        self.handles.entry_count()
    }

    /// Counters for observability
    pub async fn stats(&self) -> ModelFactoryStats {
        ModelFactoryStats {
            cached_handles: self.cached_count().await,
            hits: self.hits.get(),
            misses: self.misses.get(),
            creations: self.creations.get(),
            reopened: self.reopened.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{InMemoryStoreRegistry, TenantRecord};
    use pos_common::RouterConfig;
    use pos_store::{Filter, MemoryDriver};

    struct Fixture {
        driver: Arc<MemoryDriver>,
        factory: Arc<ModelFactory>,
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(MemoryDriver::new());
        let config = RouterConfig::with_base_uri("mongodb://localhost:27017/?retryWrites=true");
        let shards = Arc::new(ShardRegistry::new(Arc::new(config), driver.clone()).unwrap());
        let registry = Arc::new(InMemoryStoreRegistry::with_records(vec![
            TenantRecord::new("st-acme", TenantPrefix::parse("acme").unwrap(), ShardId::from_raw(1)),
            TenantRecord::new("st-beta", TenantPrefix::parse("beta").unwrap(), ShardId::from_raw(2)),
        ]));
        let resolver = Arc::new(TenantResolver::new(registry, 5));
        Fixture {
            driver,
            factory: Arc::new(ModelFactory::new(shards, resolver)),
        }
    }

    #[tokio::test]
    async fn test_handle_created_once() {
        let fx = fixture();
        let shard = ShardId::from_raw(3);

        let first = fx.factory.get_handle("acme", shard, EntityKind::Product).await.unwrap();
        let second = fx.factory.get_handle("acme", shard, EntityKind::Product).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "acme_products");
        assert_eq!(fx.driver.database("pos_db_3").create_calls(), 1);

        let stats = fx.factory.stats().await;
        assert_eq!(stats.creations, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.cached_handles, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_access() {
        let fx = fixture();
        let shard = ShardId::from_raw(2);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let factory = fx.factory.clone();
                tokio::spawn(async move { factory.get_handle("beta", shard, EntityKind::Customer).await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(fx.driver.database("pos_db_2").create_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let fx = fixture();
        let shard = ShardId::from_raw(1);

        let err = fx.factory.get_handle("Acme!", shard, EntityKind::Product).await.unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));

        let long = "a".repeat(250);
        let err = fx.factory.get_handle(&long, shard, EntityKind::Product).await.unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));

        let err = fx.factory.get_handle("acme", ShardId::from_raw(6), EntityKind::Product).await.unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
        assert_eq!(fx.driver.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_for_tenant() {
        let fx = fixture();
        let handle = fx.factory.get_handle_for_tenant("ST-BETA", EntityKind::CustomerPayment).await.unwrap();
        assert_eq!(handle.name(), "beta_customer_payments");
        assert_eq!(handle.shard_id().get(), 2);

        let err = fx.factory.get_handle_for_tenant("gamma", EntityKind::Product).await.unwrap_err();
        assert!(matches!(err, RouterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_default_namespace() {
        let fx = fixture();
        let handle = fx.factory.get_handle_for_optional_tenant(None, EntityKind::Unit).await.unwrap();
        assert_eq!(handle.name(), "units");
        assert_eq!(handle.namespace(), &Namespace::Default);
        assert_eq!(handle.shard_id().get(), 1);

        let err = fx.factory.get_default_handle(EntityKind::Customer).await.unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));

        let tenant = fx.factory.get_handle_for_optional_tenant(Some("acme"), EntityKind::Unit).await.unwrap();
        assert_eq!(tenant.name(), "acme_units");
    }

    #[tokio::test]
    async fn test_reopen_after_reconnect() {
        let fx = fixture();
        let shard = ShardId::from_raw(1);
        let first = fx.factory.get_handle("acme", shard, EntityKind::Category).await.unwrap();

        fx.driver.sever("pos_db_1");
        let second = fx.factory.get_handle("acme", shard, EntityKind::Category).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(fx.factory.stats().await.reopened, 1);

        let third = fx.factory.get_handle("acme", shard, EntityKind::Category).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));

        // A handle kept across the reconnect does not run on the dead connection
        let stale = first.count(&Filter::All).await.unwrap_err();
        assert!(stale.is_service_unavailable());
        assert_eq!(second.count(&Filter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let fx = fixture();
        let shard = ShardId::from_raw(1);
        let first = fx.factory.get_handle("acme", shard, EntityKind::Unit).await.unwrap();
        fx.factory.clear_cache().await;
        assert_eq!(fx.factory.cached_count().await, 0);

        let second = fx.factory.get_handle("acme", shard, EntityKind::Unit).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(fx.driver.database("pos_db_1").create_calls(), 2);
    }
}
