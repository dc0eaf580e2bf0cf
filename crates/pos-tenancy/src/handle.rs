//! Schema-bound collection handles

use crate::map_driver_error;
use crate::schema::{Entity, EntityKind, SchemaDescriptor};
use crate::shard::ShardConnection;
use pos_common::{Namespace, RouterError, RouterResult, ShardId};
use pos_store::{Document, DocumentStore, Filter};
use std::fmt;
use std::sync::Arc;

/// Data-access object bound to one collection on one shard.
///
/// Handles are created once per `(shard, collection)` by the model factory
/// and shared; two lookups of the same key return the same `Arc`.
pub struct CollectionHandle {
    name: String,
    namespace: Namespace,
    shard_id: ShardId,
    schema: SchemaDescriptor,
    store: Arc<dyn DocumentStore>,
    /// Connection the collection was opened on
    origin: ShardConnection,
}

impl CollectionHandle {
    /// Create (or open) `kind`'s collection for `namespace` on `connection`
    pub(crate) async fn open(
        connection: ShardConnection,
        namespace: Namespace,
        kind: EntityKind,
    ) -> RouterResult<Self> {
        let name = kind.collection_name(&namespace)?;
        let schema = kind.schema();
        let store = connection
            .database()
            .create_collection(&schema.collection_spec(&name))
            .await
            .map_err(|e| map_driver_error(Some(connection.id), e))?;

        Ok(Self {
            name,
            namespace,
            shard_id: connection.id,
            schema,
            store,
            origin: connection,
        })
    }

    /// Whether the handle was opened on `connection`
    pub(crate) fn opened_on(&self, connection: &ShardConnection) -> bool {
        self.origin.same_connection(connection)
    }

    /// Physical collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace the collection belongs to
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Hosting shard
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Entity kind stored here
    pub fn kind(&self) -> EntityKind {
        self.schema.kind
    }

    /// Schema descriptor
    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    fn check_kind<E: Entity>(&self) -> RouterResult<()> {
        if E::KIND != self.schema.kind {
            return Err(RouterError::validation(format!(
                "{} handle '{}' cannot store {}",
                self.schema.kind, self.name, E::KIND
            )));
        }
        Ok(())
    }

    fn encode<E: Entity>(&self, entity: &E) -> RouterResult<Document> {
        let doc = serde_json::to_value(entity)
            .map_err(|e| RouterError::validation(format!("{} encode: {}", E::KIND, e)))?;
        self.schema.validate_document(&doc)?;
        Ok(doc)
    }

    fn decode<E: Entity>(&self, doc: Document) -> RouterResult<E> {
        serde_json::from_value(doc).map_err(|e| {
            RouterError::validation(format!("malformed {} document in '{}': {}", E::KIND, self.name, e))
        })
    }

    /// Insert an entity; `Conflict` on a duplicate id or unique key
    pub async fn insert<E: Entity>(&self, entity: &E) -> RouterResult<()> {
        self.check_kind::<E>()?;
        let doc = self.encode(entity)?;
        self.store
            .insert_one(doc)
            .await
            .map_err(|e| map_driver_error(Some(self.shard_id), e))
    }

    /// Entity with the given primary key
    pub async fn find_by_id<E: Entity>(&self, id: &str) -> RouterResult<Option<E>> {
        self.find_one(&Filter::by_id(id)).await
    }

    /// First entity matching `filter`
    pub async fn find_one<E: Entity>(&self, filter: &Filter) -> RouterResult<Option<E>> {
        self.check_kind::<E>()?;
        let doc = self
            .store
            .find_one(filter)
            .await
            .map_err(|e| map_driver_error(Some(self.shard_id), e))?;
        doc.map(|d| self.decode(d)).transpose()
    }

    /// Every entity matching `filter`
    pub async fn find<E: Entity>(&self, filter: &Filter) -> RouterResult<Vec<E>> {
        self.check_kind::<E>()?;
        let docs = self
            .store
            .find(filter)
            .await
            .map_err(|e| map_driver_error(Some(self.shard_id), e))?;
        docs.into_iter().map(|d| self.decode(d)).collect()
    }

    /// Replace the stored entity with the same id; false if it was absent
    pub async fn replace<E: Entity>(&self, entity: &E) -> RouterResult<bool> {
        self.check_kind::<E>()?;
        let doc = self.encode(entity)?;
        self.store
            .replace_one(entity.id(), doc)
            .await
            .map_err(|e| map_driver_error(Some(self.shard_id), e))
    }

    /// Delete by primary key; false if it was absent
    pub async fn delete_by_id(&self, id: &str) -> RouterResult<bool> {
        self.store
            .delete_one(id)
            .await
            .map_err(|e| map_driver_error(Some(self.shard_id), e))
    }

    /// Number of documents matching `filter`
    pub async fn count(&self, filter: &Filter) -> RouterResult<u64> {
        self.store
            .count(filter)
            .await
            .map_err(|e| map_driver_error(Some(self.shard_id), e))
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("shard_id", &self.shard_id)
            .field("kind", &self.schema.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Category, Product, Unit};
    use crate::shard::ShardRegistry;
    use pos_common::{RouterConfig, TenantPrefix};
    use pos_store::MemoryDriver;

    async fn handle(kind: EntityKind) -> CollectionHandle {
        let config = RouterConfig::with_base_uri("mongodb://localhost:27017");
        let shards = ShardRegistry::new(Arc::new(config), Arc::new(MemoryDriver::new())).unwrap();
        let conn = shards.connection_for(ShardId::from_raw(1)).await.unwrap();
        let namespace = Namespace::Tenant(TenantPrefix::parse("acme").unwrap());
        CollectionHandle::open(conn, namespace, kind).await.unwrap()
    }

    #[tokio::test]
    async fn test_typed_crud() {
        let products = handle(EntityKind::Product).await;
        assert_eq!(products.name(), "acme_products");

        let mut cola = Product::new("Cola", "SKU-1", 150);
        products.insert(&cola).await.unwrap();

        let found: Product = products.find_by_id(&cola.id).await.unwrap().unwrap();
        assert_eq!(found, cola);

        cola.price_cents = 175;
        assert!(products.replace(&cola).await.unwrap());
        let by_sku: Option<Product> = products.find_one(&Filter::eq("sku", "SKU-1")).await.unwrap();
        assert_eq!(by_sku.unwrap().price_cents, 175);

        assert_eq!(products.count(&Filter::All).await.unwrap(), 1);
        assert!(products.delete_by_id(&cola.id).await.unwrap());
        assert!(!products.delete_by_id(&cola.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unique_key_conflict() {
        let products = handle(EntityKind::Product).await;
        products.insert(&Product::new("Cola", "SKU-1", 150)).await.unwrap();
        let err = products.insert(&Product::new("Cola Zero", "SKU-1", 150)).await.unwrap_err();
        assert!(matches!(err, RouterError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let categories = handle(EntityKind::Category).await;
        categories.insert(&Category::new("Drinks")).await.unwrap();

        let err = categories.insert(&Unit::new("Litre", "l")).await.unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
        let err = categories.find::<Unit>(&Filter::All).await.unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
    }

    #[tokio::test]
    async fn test_schema_validation_on_insert() {
        let units = handle(EntityKind::Unit).await;
        let err = units.insert(&Unit::new("Litre", "  ")).await.unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
    }
}
