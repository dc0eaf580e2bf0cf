//! POS Store - Shard database boundary
//!
//! The tenancy layer never talks to a database driver directly; it goes
//! through three traits:
//!
//! - [`ShardDriver`]: opens a connection to one shard database
//! - [`ShardDatabase`]: a live connection; creates schema-bound collections
//! - [`DocumentStore`]: CRUD over one collection
//!
//! [`MemoryDriver`] implements all three in-process. It keeps state per
//! database name across reconnects (like a real server would) and supports
//! fault injection for exercising retry and scan-skip paths.

#![warn(missing_docs)]

pub mod error;
pub mod filter;
pub mod memory;
pub mod uri;

pub use error::{DriverError, DriverErrorKind, StoreResult};
pub use filter::{document_id, Document, Filter, ID_FIELD};
pub use memory::{MemoryDatabase, MemoryDriver};
pub use uri::ConnectionUri;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Options passed to every connect call
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// How long to wait for a usable server
    pub server_selection_timeout: Duration,
    /// Per-operation socket timeout
    pub socket_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            server_selection_timeout: Duration::from_secs(30),
            socket_timeout: Duration::from_secs(60),
        }
    }
}

/// Collection name plus the indexes it must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Physical collection name
    pub name: String,
    /// Unique compound indexes (field lists)
    pub unique_indexes: Vec<Vec<String>>,
}

impl CollectionSpec {
    /// Spec without secondary indexes
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_indexes: Vec::new(),
        }
    }
}

/// Opens shard connections
#[async_trait]
pub trait ShardDriver: Send + Sync {
    /// Connect to the database named in `uri`
    async fn connect(
        &self,
        uri: &ConnectionUri,
        options: &ConnectOptions,
    ) -> StoreResult<Arc<dyn ShardDatabase>>;
}

/// A live connection to one shard database
#[async_trait]
pub trait ShardDatabase: Send + Sync {
    /// Database name
    fn name(&self) -> &str;

    /// Whether the connection is still usable without a round trip
    fn is_live(&self) -> bool;

    /// Round-trip health check
    async fn ping(&self) -> StoreResult<()>;

    /// Create (or open) a collection and its indexes
    async fn create_collection(&self, spec: &CollectionSpec) -> StoreResult<Arc<dyn DocumentStore>>;

    /// Names of existing collections
    async fn list_collections(&self) -> StoreResult<Vec<String>>;

    /// Close the connection; later calls fail
    async fn close(&self);
}

/// CRUD over a single collection
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Collection name
    fn name(&self) -> &str;

    /// Insert; fails with `DuplicateKey` on `_id` or unique index clash
    async fn insert_one(&self, doc: Document) -> StoreResult<()>;

    /// First document matching `filter`
    async fn find_one(&self, filter: &Filter) -> StoreResult<Option<Document>>;

    /// All documents matching `filter`
    async fn find(&self, filter: &Filter) -> StoreResult<Vec<Document>>;

    /// Replace the document with `id`; returns false if absent
    async fn replace_one(&self, id: &str, doc: Document) -> StoreResult<bool>;

    /// Delete the document with `id`; returns false if absent
    async fn delete_one(&self, id: &str) -> StoreResult<bool>;

    /// Number of documents matching `filter`
    async fn count(&self, filter: &Filter) -> StoreResult<u64>;
}
