//! POS Tenancy - Shard routing and per-tenant model management
//!
//! Every store (tenant) owns a set of prefixed collections on one of N
//! shard databases. This crate answers "which collection on which shard"
//! for each request:
//!
//! ```text
//!   tenant id ──► TenantResolver ──► (prefix, shard)
//!                                         │
//!   entity kind ──────────────────────────▼
//!                                   ModelFactory ──► CollectionHandle
//!                                         │               (cached per
//!                                   ShardRegistry          shard+name)
//!                                   (one connection
//!                                    per shard)
//! ```
//!
//! Users add a cross-tenant [`UserDirectory`] with a login
//! [`DirectoryCache`] in front of it.

#![warn(missing_docs)]

pub mod directory_cache;
pub mod entities;
pub mod factory;
pub mod handle;
pub mod placement;
pub mod resolver;
pub mod schema;
pub mod shard;
pub mod stores;
pub mod users;

pub use directory_cache::{DirectoryCache, DirectoryCacheStats, DirectoryEntry};
pub use entities::{
    Category, Customer, CustomerPayment, PasswordHash, PaymentMethod, Product, Role, Unit, User, UserProfile,
};
pub use factory::{HandleKey, ModelFactory, ModelFactoryStats};
pub use handle::CollectionHandle;
pub use placement::{least_loaded_shard, shard_loads};
pub use resolver::{TenantPlacement, TenantResolver};
pub use schema::{Entity, EntityKind, SchemaDescriptor};
pub use shard::{ConnectionState, ShardConnection, ShardHealth, ShardRegistry, ShardRegistryStats};
pub use stores::{InMemoryStoreRegistry, ShardHostedStoreRegistry, StoreRegistry, TenantRecord};
pub use users::{ReconcileReport, UserDirectory, UserDirectoryStats, UserQuery};

use pos_common::{RouterConfig, RouterError, RouterResult, ShardId};
use pos_store::{DriverError, DriverErrorKind, ShardDriver};
use std::sync::Arc;

/// Translate a driver failure on an established connection
pub(crate) fn map_driver_error(shard: Option<ShardId>, err: DriverError) -> RouterError {
    match err.kind {
        DriverErrorKind::InvalidUri => RouterError::Configuration(err.message),
        DriverErrorKind::DuplicateKey => RouterError::Conflict(err.message),
        _ => RouterError::connection(shard, 1, err.to_string()),
    }
}

/// Fully wired tenancy stack
pub struct PosTenancy {
    /// Shard connections
    pub shards: Arc<ShardRegistry>,
    /// Tenant resolution
    pub resolver: Arc<TenantResolver>,
    /// Collection handles
    pub models: Arc<ModelFactory>,
    /// Cross-tenant users
    pub users: Arc<UserDirectory>,
}

impl PosTenancy {
    /// Wire the stack around an existing store registry
    pub fn new(
        config: RouterConfig,
        driver: Arc<dyn ShardDriver>,
        stores: Arc<dyn StoreRegistry>,
    ) -> RouterResult<Self> {
        let shards = Arc::new(ShardRegistry::new(Arc::new(config), driver)?);
        Ok(Self::assemble(shards, stores))
    }

    /// Wire the stack with the store registry kept on the system shard
    pub fn with_shard_hosted_registry(config: RouterConfig, driver: Arc<dyn ShardDriver>) -> RouterResult<Self> {
        let shards = Arc::new(ShardRegistry::new(Arc::new(config), driver)?);
        let stores = Arc::new(ShardHostedStoreRegistry::new(shards.clone()));
        Ok(Self::assemble(shards, stores))
    }

    fn assemble(shards: Arc<ShardRegistry>, stores: Arc<dyn StoreRegistry>) -> Self {
        let config = shards.config();
        let resolver = Arc::new(TenantResolver::new(stores, config.shard_count));
        let cache = Arc::new(DirectoryCache::from_config(config));
        let models = Arc::new(ModelFactory::new(shards.clone(), resolver.clone()));
        let users = Arc::new(UserDirectory::new(models.clone(), cache));

        tracing::info!(
            shards = config.shard_count,
            system_shard = config.system_shard,
            "Tenancy stack ready"
        );

        Self {
            shards,
            resolver,
            models,
            users,
        }
    }

    /// Drop cached handles and close every shard connection
    pub async fn shutdown(&self) {
        self.models.clear_cache().await;
        self.shards.close_all().await;
        tracing::info!("Tenancy stack shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pos_store::MemoryDriver;

    #[test]
    fn test_wiring_and_shutdown() {
        let config = RouterConfig::with_base_uri("mongodb://localhost:27017");
        let stores = Arc::new(InMemoryStoreRegistry::new());
        let tenancy = PosTenancy::new(config, Arc::new(MemoryDriver::new()), stores).unwrap();

        tokio_test::block_on(async {
            let handle = tenancy.users.get_user_handle(None).await.unwrap();
            assert_eq!(handle.name(), "system_users");
            assert_eq!(tenancy.shards.count(), 1);

            tenancy.shutdown().await;
            assert_eq!(tenancy.shards.count(), 0);
            assert_eq!(tenancy.models.cached_count().await, 0);
        });
    }

    #[test]
    fn test_bad_base_uri_is_configuration_error() {
        let config = RouterConfig::with_base_uri("not a uri");
        let result = PosTenancy::new(config, Arc::new(MemoryDriver::new()), Arc::new(InMemoryStoreRegistry::new()));
        assert!(matches!(result, Err(RouterError::Configuration(_))));
    }

    #[test]
    fn test_driver_error_mapping() {
        let shard = Some(ShardId::from_raw(2));
        let err = map_driver_error(shard, DriverError::new(DriverErrorKind::DuplicateKey, "E11000"));
        assert!(matches!(err, RouterError::Conflict(_)));

        let err = map_driver_error(shard, DriverError::new(DriverErrorKind::InvalidUri, "bad"));
        assert!(matches!(err, RouterError::Configuration(_)));

        let err = map_driver_error(shard, DriverError::new(DriverErrorKind::NetworkClosed, "closed"));
        assert!(matches!(err, RouterError::Connection { shard_id: Some(s), .. } if s.get() == 2));
    }
}
