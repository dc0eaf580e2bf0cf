//! In-process document backend
//!
//! Databases live in the driver and outlive individual connections, so a
//! reconnect sees the same data. Tests steer failures through
//! [`MemoryDriver::fail_next`], [`MemoryDriver::fail_next_reads`],
//! [`MemoryDriver::set_unreachable`] and [`MemoryDriver::sever`].

use crate::error::{DriverError, DriverErrorKind, StoreResult};
use crate::filter::{document_id, Document, Filter, ID_FIELD};
use crate::uri::ConnectionUri;
use crate::{CollectionSpec, ConnectOptions, DocumentStore, ShardDatabase, ShardDriver};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use pos_common::AtomicCounter;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-process shard driver
pub struct MemoryDriver {
    databases: DashMap<String, Arc<MemoryDatabase>>,
    /// Queued connect failures per database name
    faults: Mutex<HashMap<String, VecDeque<DriverErrorKind>>>,
    connect_delay: Mutex<Duration>,
    connects: AtomicCounter,
}

impl MemoryDriver {
    /// Create empty driver
    pub fn new() -> Self {
        Self {
            databases: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            connects: AtomicCounter::new(0),
        }
    }

    /// Database by name, created on first use
    pub fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        self.databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(name)))
            .clone()
    }

    /// Make the next `times` connects to `database` fail with `kind`
    pub fn fail_next(&self, database: &str, kind: DriverErrorKind, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(database.to_string()).or_default();
        queue.extend(std::iter::repeat(kind).take(times));
    }

    /// Refuse connects and operations for `database` until cleared
    pub fn set_unreachable(&self, database: &str, unreachable: bool) {
        self.database(database)
            .unreachable
            .store(unreachable, Ordering::SeqCst);
    }

    /// Make the next `times` document reads on `database` fail
    pub fn fail_next_reads(&self, database: &str, times: u64) {
        self.database(database)
            .read_faults
            .fetch_add(times, Ordering::SeqCst);
    }

    /// Simulated connect latency
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Drop every existing connection to `database`
    pub fn sever(&self, database: &str) {
        self.database(database).generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Total connect calls seen
    pub fn connect_count(&self) -> u64 {
        self.connects.get()
    }

    fn take_fault(&self, database: &str) -> Option<DriverErrorKind> {
        self.faults
            .lock()
            .get_mut(database)
            .and_then(|queue| queue.pop_front())
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardDriver for MemoryDriver {
    async fn connect(
        &self,
        uri: &ConnectionUri,
        options: &ConnectOptions,
    ) -> StoreResult<Arc<dyn ShardDatabase>> {
        self.connects.inc();

        let name = uri
            .database()
            .ok_or_else(|| DriverError::new(DriverErrorKind::InvalidUri, "no database in uri"))?;

        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            if delay > options.server_selection_timeout {
                tokio::time::sleep(options.server_selection_timeout).await;
                return Err(DriverError::new(
                    DriverErrorKind::Timeout,
                    format!("server selection timed out for {}", uri.hosts()),
                ));
            }
            tokio::time::sleep(delay).await;
        }

        if let Some(kind) = self.take_fault(name) {
            tracing::debug!(database = %name, ?kind, "Injected connect failure");
            return Err(DriverError::new(kind, format!("injected failure for {}", name)));
        }

        let db = self.database(name);
        if db.is_unreachable() {
            return Err(DriverError::new(
                DriverErrorKind::ConnectionRefused,
                format!("{} refused connection", uri.hosts()),
            ));
        }

        let generation = db.generation.load(Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            session: Arc::new(Session {
                db,
                generation,
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

/// One named database shared by all its connections
pub struct MemoryDatabase {
    name: String,
    collections: DashMap<String, Arc<MemoryCollection>>,
    unreachable: AtomicBool,
    generation: AtomicU64,
    read_faults: AtomicU64,
    create_calls: AtomicCounter,
}

impl MemoryDatabase {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            collections: DashMap::new(),
            unreachable: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            read_faults: AtomicU64::new(0),
            create_calls: AtomicCounter::new(0),
        }
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Existing collection by name
    pub fn collection(&self, name: &str) -> Option<Arc<MemoryCollection>> {
        self.collections.get(name).map(|c| c.clone())
    }

    /// Number of `create_collection` calls received
    pub fn create_calls(&self) -> u64 {
        self.create_calls.get()
    }

    fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::SeqCst)
    }

    fn take_read_fault(&self) -> bool {
        self.read_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// State of one driver connection, shared with every collection it opened
struct Session {
    db: Arc<MemoryDatabase>,
    generation: u64,
    closed: AtomicBool,
}

impl Session {
    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.db.generation.load(Ordering::SeqCst) == self.generation
    }

    fn check(&self) -> StoreResult<()> {
        if !self.is_live() || self.db.is_unreachable() {
            return Err(DriverError::new(
                DriverErrorKind::NetworkClosed,
                format!("connection to {} is closed", self.db.name),
            ));
        }
        Ok(())
    }
}

struct MemoryConnection {
    session: Arc<Session>,
}

#[async_trait]
impl ShardDatabase for MemoryConnection {
    fn name(&self) -> &str {
        &self.session.db.name
    }

    fn is_live(&self) -> bool {
        self.session.is_live()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.session.check()
    }

    async fn create_collection(&self, spec: &CollectionSpec) -> StoreResult<Arc<dyn DocumentStore>> {
        self.session.check()?;
        let db = &self.session.db;
        db.create_calls.inc();

        let collection = db
            .collections
            .entry(spec.name.clone())
            .or_insert_with(|| Arc::new(MemoryCollection::new(&spec.name)))
            .clone();
        collection.ensure_indexes(&spec.unique_indexes);

        Ok(Arc::new(SessionCollection {
            session: self.session.clone(),
            collection,
        }))
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        self.session.check()?;
        let mut names: Vec<String> = self.session.db.collections.iter().map(|c| c.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn close(&self) {
        self.session.closed.store(true, Ordering::SeqCst);
    }
}

/// One collection; documents keyed by `_id`
pub struct MemoryCollection {
    name: String,
    docs: RwLock<BTreeMap<String, Document>>,
    unique_indexes: RwLock<Vec<Vec<String>>>,
    find_calls: AtomicCounter,
}

impl MemoryCollection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            docs: RwLock::new(BTreeMap::new()),
            unique_indexes: RwLock::new(Vec::new()),
            find_calls: AtomicCounter::new(0),
        }
    }

    /// Stored document count
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Whether the collection holds no documents
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Number of `find_one`/`find` calls received
    pub fn find_calls(&self) -> u64 {
        self.find_calls.get()
    }

    fn ensure_indexes(&self, indexes: &[Vec<String>]) {
        let mut current = self.unique_indexes.write();
        for index in indexes {
            if !current.contains(index) {
                current.push(index.clone());
            }
        }
    }

    fn check_unique(&self, docs: &BTreeMap<String, Document>, doc: &Document, id: &str) -> StoreResult<()> {
        for index in self.unique_indexes.read().iter() {
            let key: Vec<&Value> = index
                .iter()
                .map(|field| doc.get(field).unwrap_or(&Value::Null))
                .collect();
            if key.iter().all(|v| v.is_null()) {
                continue;
            }

            let clash = docs.iter().any(|(other_id, other)| {
                other_id != id
                    && index
                        .iter()
                        .zip(&key)
                        .all(|(field, v)| other.get(field).unwrap_or(&Value::Null) == *v)
            });
            if clash {
                return Err(DriverError::new(
                    DriverErrorKind::DuplicateKey,
                    format!("E11000 duplicate key in {} on {:?}", self.name, index),
                ));
            }
        }
        Ok(())
    }
}

fn require_id(doc: &Document) -> StoreResult<String> {
    document_id(doc)
        .map(str::to_string)
        .ok_or_else(|| DriverError::new(DriverErrorKind::Other, format!("document has no string {}", ID_FIELD)))
}

/// A collection as seen through the connection that opened it
///
/// Operations fail with `NetworkClosed` once that connection is closed or
/// severed, even though the documents stay in the shared collection.
struct SessionCollection {
    session: Arc<Session>,
    collection: Arc<MemoryCollection>,
}

impl SessionCollection {
    fn check_read(&self) -> StoreResult<()> {
        self.session.check()?;
        if self.session.db.take_read_fault() {
            tracing::debug!(collection = %self.collection.name, "Injected read failure");
            return Err(DriverError::new(
                DriverErrorKind::NetworkClosed,
                format!("injected read failure on {}", self.collection.name),
            ));
        }
        self.collection.find_calls.inc();
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SessionCollection {
    fn name(&self) -> &str {
        &self.collection.name
    }

    async fn insert_one(&self, doc: Document) -> StoreResult<()> {
        self.session.check()?;
        let id = require_id(&doc)?;

        let mut docs = self.collection.docs.write();
        if docs.contains_key(&id) {
            return Err(DriverError::new(
                DriverErrorKind::DuplicateKey,
                format!("E11000 duplicate key in {} on _id '{}'", self.collection.name, id),
            ));
        }
        self.collection.check_unique(&docs, &doc, &id)?;
        docs.insert(id, doc);
        Ok(())
    }

    async fn find_one(&self, filter: &Filter) -> StoreResult<Option<Document>> {
        self.check_read()?;
        Ok(self.collection.docs.read().values().find(|d| filter.matches(d)).cloned())
    }

    async fn find(&self, filter: &Filter) -> StoreResult<Vec<Document>> {
        self.check_read()?;
        Ok(self
            .collection
            .docs
            .read()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn replace_one(&self, id: &str, doc: Document) -> StoreResult<bool> {
        self.session.check()?;
        let mut docs = self.collection.docs.write();
        if !docs.contains_key(id) {
            return Ok(false);
        }
        self.collection.check_unique(&docs, &doc, id)?;
        docs.insert(id.to_string(), doc);
        Ok(true)
    }

    async fn delete_one(&self, id: &str) -> StoreResult<bool> {
        self.session.check()?;
        Ok(self.collection.docs.write().remove(id).is_some())
    }

    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        self.session.check()?;
        Ok(self.collection.docs.read().values().filter(|d| filter.matches(d)).count() as u64)
    }
}
