//! Store registry
//!
//! The registry maps store ids and prefixes to the shard hosting them. The
//! tenancy layer only consumes it; the owning service writes records when
//! stores are created and when a store is explicitly moved between shards.

use crate::map_driver_error;
use crate::shard::{ShardConnection, ShardRegistry};
use async_trait::async_trait;
use parking_lot::RwLock;
use pos_common::{AtomicCounter, RouterError, RouterResult, ShardId, TenantPrefix};
use pos_store::{CollectionSpec, DocumentStore, Filter, ID_FIELD};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name of the registry collection on the system shard
pub const STORES_COLLECTION: &str = "stores";

/// Registry entry for one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Store id
    #[serde(rename = "_id")]
    pub store_id: String,
    /// Collection-naming prefix
    pub prefix: TenantPrefix,
    /// Shard hosting the store's collections
    pub shard_id: ShardId,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

impl TenantRecord {
    /// Create record
    pub fn new(store_id: impl Into<String>, prefix: TenantPrefix, shard_id: ShardId) -> Self {
        Self {
            store_id: store_id.into(),
            prefix,
            shard_id,
            name: None,
        }
    }

    /// Set display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Store registry collaborator
#[async_trait]
pub trait StoreRegistry: Send + Sync {
    /// Record whose prefix equals `prefix`
    async fn find_by_prefix(&self, prefix: &str) -> RouterResult<Option<TenantRecord>>;

    /// Record whose store id equals `store_id` (case-insensitive)
    async fn find_by_store_id(&self, store_id: &str) -> RouterResult<Option<TenantRecord>>;

    /// Every record, in registry order
    async fn list_all(&self) -> RouterResult<Vec<TenantRecord>>;

    /// Add a record; `Conflict` on duplicate store id or prefix
    async fn insert(&self, record: TenantRecord) -> RouterResult<()>;

    /// Move a store to another shard
    async fn update_shard(&self, store_id: &str, shard: ShardId) -> RouterResult<TenantRecord>;
}

/// In-memory registry (tests and development)
pub struct InMemoryStoreRegistry {
    records: RwLock<Vec<TenantRecord>>,
    unreachable: AtomicBool,
    list_calls: AtomicCounter,
}

impl InMemoryStoreRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            list_calls: AtomicCounter::new(0),
        }
    }

    /// Registry pre-populated with records
    pub fn with_records(records: Vec<TenantRecord>) -> Self {
        let registry = Self::new();
        *registry.records.write() = records;
        registry
    }

    /// Simulate an outage of the hosting shard
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of `list_all` calls (scan instrumentation)
    pub fn list_calls(&self) -> u64 {
        self.list_calls.get()
    }

    fn check(&self) -> RouterResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RouterError::connection(None, 1, "store registry unreachable"));
        }
        Ok(())
    }
}

impl Default for InMemoryStoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreRegistry for InMemoryStoreRegistry {
    async fn find_by_prefix(&self, prefix: &str) -> RouterResult<Option<TenantRecord>> {
        self.check()?;
        Ok(self
            .records
            .read()
            .iter()
            .find(|r| r.prefix.as_str() == prefix)
            .cloned())
    }

    async fn find_by_store_id(&self, store_id: &str) -> RouterResult<Option<TenantRecord>> {
        self.check()?;
        Ok(self
            .records
            .read()
            .iter()
            .find(|r| r.store_id.eq_ignore_ascii_case(store_id))
            .cloned())
    }

    async fn list_all(&self) -> RouterResult<Vec<TenantRecord>> {
        self.check()?;
        self.list_calls.inc();
        Ok(self.records.read().clone())
    }

    async fn insert(&self, record: TenantRecord) -> RouterResult<()> {
        self.check()?;
        let mut records = self.records.write();
        if records
            .iter()
            .any(|r| r.store_id.eq_ignore_ascii_case(&record.store_id) || r.prefix == record.prefix)
        {
            return Err(RouterError::Conflict(format!(
                "store '{}' or prefix '{}' already registered",
                record.store_id, record.prefix
            )));
        }
        records.push(record);
        Ok(())
    }

    async fn update_shard(&self, store_id: &str, shard: ShardId) -> RouterResult<TenantRecord> {
        self.check()?;
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.store_id.eq_ignore_ascii_case(store_id))
            .ok_or_else(|| RouterError::not_found(format!("store '{}'", store_id)))?;
        record.shard_id = shard;
        Ok(record.clone())
    }
}

/// Registry kept in the `stores` collection of the system shard
///
/// The collection is reopened whenever [`ShardRegistry`] hands back a
/// different connection than the one it was opened on.
pub struct ShardHostedStoreRegistry {
    shards: Arc<ShardRegistry>,
    shard: ShardId,
    opened: RwLock<Option<OpenedCollection>>,
    open_lock: tokio::sync::Mutex<()>,
    opens: AtomicCounter,
}

struct OpenedCollection {
    origin: ShardConnection,
    store: Arc<dyn DocumentStore>,
}

impl ShardHostedStoreRegistry {
    /// Registry on the configured system shard
    pub fn new(shards: Arc<ShardRegistry>) -> Self {
        let shard = shards.config().system_shard_id();
        Self {
            shards,
            shard,
            opened: RwLock::new(None),
            open_lock: tokio::sync::Mutex::new(()),
            opens: AtomicCounter::new(0),
        }
    }

    /// Times the `stores` collection has been opened
    pub fn open_count(&self) -> u64 {
        self.opens.get()
    }

    fn opened_on(&self, conn: &ShardConnection) -> Option<Arc<dyn DocumentStore>> {
        self.opened
            .read()
            .as_ref()
            .filter(|o| o.origin.same_connection(conn))
            .map(|o| o.store.clone())
    }

    async fn collection(&self) -> RouterResult<Arc<dyn DocumentStore>> {
        let conn = self.shards.connection_for(self.shard).await?;
        if let Some(store) = self.opened_on(&conn) {
            return Ok(store);
        }

        let _guard = self.open_lock.lock().await;
        if let Some(store) = self.opened_on(&conn) {
            return Ok(store);
        }

        let spec = CollectionSpec {
            name: STORES_COLLECTION.to_string(),
            unique_indexes: vec![vec!["prefix".to_string()]],
        };
        let store = conn
            .database()
            .create_collection(&spec)
            .await
            .map_err(|e| map_driver_error(Some(self.shard), e))?;

        let previous = self.opened.write().replace(OpenedCollection {
            origin: conn,
            store: store.clone(),
        });
        if previous.is_some() {
            tracing::info!(shard_id = %self.shard, "Reopened store registry collection");
        }
        self.opens.inc();
        Ok(store)
    }

    fn decode(&self, doc: serde_json::Value) -> RouterResult<TenantRecord> {
        let record: TenantRecord = serde_json::from_value(doc)
            .map_err(|e| RouterError::validation(format!("malformed store record: {}", e)))?;
        self.shards.validate(record.shard_id)?;
        Ok(record)
    }

    async fn find(&self, filter: Filter) -> RouterResult<Option<TenantRecord>> {
        let doc = self
            .collection()
            .await?
            .find_one(&filter)
            .await
            .map_err(|e| map_driver_error(Some(self.shard), e))?;
        doc.map(|d| self.decode(d)).transpose()
    }
}

#[async_trait]
impl StoreRegistry for ShardHostedStoreRegistry {
    async fn find_by_prefix(&self, prefix: &str) -> RouterResult<Option<TenantRecord>> {
        self.find(Filter::eq("prefix", prefix)).await
    }

    async fn find_by_store_id(&self, store_id: &str) -> RouterResult<Option<TenantRecord>> {
        if let Some(record) = self.find(Filter::eq(ID_FIELD, store_id)).await? {
            return Ok(Some(record));
        }
        // Fall back to a case-insensitive match
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .find(|r| r.store_id.eq_ignore_ascii_case(store_id)))
    }

    async fn list_all(&self) -> RouterResult<Vec<TenantRecord>> {
        let docs = self
            .collection()
            .await?
            .find(&Filter::All)
            .await
            .map_err(|e| map_driver_error(Some(self.shard), e))?;
        docs.into_iter().map(|d| self.decode(d)).collect()
    }

    async fn insert(&self, record: TenantRecord) -> RouterResult<()> {
        self.shards.validate(record.shard_id)?;
        let doc = serde_json::to_value(&record)
            .map_err(|e| RouterError::validation(format!("store record: {}", e)))?;
        self.collection()
            .await?
            .insert_one(doc)
            .await
            .map_err(|e| map_driver_error(Some(self.shard), e))
    }

    async fn update_shard(&self, store_id: &str, shard: ShardId) -> RouterResult<TenantRecord> {
        self.shards.validate(shard)?;
        let mut record = self
            .find_by_store_id(store_id)
            .await?
            .ok_or_else(|| RouterError::not_found(format!("store '{}'", store_id)))?;
        record.shard_id = shard;

        let doc = serde_json::to_value(&record)
            .map_err(|e| RouterError::validation(format!("store record: {}", e)))?;
        let replaced = self
            .collection()
            .await?
            .replace_one(&record.store_id, doc)
            .await
            .map_err(|e| map_driver_error(Some(self.shard), e))?;
        if !replaced {
            return Err(RouterError::not_found(format!("store '{}'", store_id)));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pos_common::RouterConfig;
    use pos_store::MemoryDriver;

    fn record(store_id: &str, prefix: &str, shard: u16) -> TenantRecord {
        TenantRecord::new(store_id, TenantPrefix::parse(prefix).unwrap(), ShardId::from_raw(shard))
    }

    #[tokio::test]
    async fn test_in_memory_lookups() {
        let registry = InMemoryStoreRegistry::with_records(vec![record("ST-001", "acme", 1)]);

        assert!(registry.find_by_prefix("acme").await.unwrap().is_some());
        assert!(registry.find_by_store_id("st-001").await.unwrap().is_some());
        assert!(registry.find_by_prefix("beta").await.unwrap().is_none());

        let dup = registry.insert(record("st-002", "acme", 2)).await.unwrap_err();
        assert!(matches!(dup, RouterError::Conflict(_)));

        let moved = registry.update_shard("ST-001", ShardId::from_raw(4)).await.unwrap();
        assert_eq!(moved.shard_id.get(), 4);
    }

    #[tokio::test]
    async fn test_in_memory_unreachable() {
        let registry = InMemoryStoreRegistry::new();
        registry.set_unreachable(true);
        let err = registry.list_all().await.unwrap_err();
        assert!(err.is_service_unavailable());
        assert_eq!(registry.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_shard_hosted_registry() {
        let driver = Arc::new(MemoryDriver::new());
        let config = RouterConfig::with_base_uri("mongodb://localhost:27017");
        let shards = Arc::new(ShardRegistry::new(Arc::new(config), driver.clone()).unwrap());
        let registry = ShardHostedStoreRegistry::new(shards);

        registry.insert(record("st-001", "acme", 1).with_name("Acme")).await.unwrap();
        registry.insert(record("st-002", "beta", 2)).await.unwrap();

        let dup = registry.insert(record("st-003", "acme", 3)).await.unwrap_err();
        assert!(matches!(dup, RouterError::Conflict(_)));

        let acme = registry.find_by_prefix("acme").await.unwrap().unwrap();
        assert_eq!(acme.name.as_deref(), Some("Acme"));
        assert_eq!(registry.find_by_store_id("ST-002").await.unwrap().unwrap().prefix.as_str(), "beta");
        assert_eq!(registry.list_all().await.unwrap().len(), 2);

        let moved = registry.update_shard("st-002", ShardId::from_raw(5)).await.unwrap();
        assert_eq!(registry.find_by_prefix("beta").await.unwrap().unwrap().shard_id, moved.shard_id);

        let bad = registry.insert(record("st-009", "zeta", 9)).await.unwrap_err();
        assert!(matches!(bad, RouterError::Validation(_)));

        let stores = driver.database("pos_db_1").collection(STORES_COLLECTION).unwrap();
        assert_eq!(stores.len(), 2);
    }

    #[tokio::test]
    async fn test_shard_hosted_registry_unreachable() {
        let driver = Arc::new(MemoryDriver::new());
        driver.set_unreachable("pos_db_1", true);
        let mut config = RouterConfig::with_base_uri("mongodb://localhost:27017");
        config.retry.initial_backoff_ms = 1;
        let shards = Arc::new(ShardRegistry::new(Arc::new(config), driver).unwrap());
        let registry = ShardHostedStoreRegistry::new(shards);

        let err = registry.find_by_prefix("acme").await.unwrap_err();
        assert!(err.is_service_unavailable());
    }

    #[tokio::test]
    async fn test_shard_hosted_registry_reopens_after_reconnect() {
        let driver = Arc::new(MemoryDriver::new());
        let mut config = RouterConfig::with_base_uri("mongodb://localhost:27017");
        config.retry.initial_backoff_ms = 1;
        let shards = Arc::new(ShardRegistry::new(Arc::new(config), driver.clone()).unwrap());
        let registry = ShardHostedStoreRegistry::new(shards.clone());

        registry.insert(record("st-001", "acme", 1)).await.unwrap();
        assert!(registry.find_by_prefix("acme").await.unwrap().is_some());
        assert_eq!(registry.open_count(), 1);

        driver.sever("pos_db_1");
        assert_eq!(registry.list_all().await.unwrap().len(), 1);
        assert_eq!(registry.open_count(), 2);
        assert_eq!(shards.stats().evictions, 1);

        shards.close_all().await;
        assert!(registry.find_by_prefix("acme").await.unwrap().is_some());
        assert_eq!(registry.open_count(), 3);
        assert_eq!(shards.count(), 1);
    }
}
