//! Shard connection registry
//!
//! Owns one connection slot per shard id in `[1, N]`. Connections are made
//! lazily, retried with exponential backoff on transient failures, and
//! replaced transparently when a cached one goes dead.

use parking_lot::RwLock;
use pos_common::{AtomicCounter, RouterConfig, RouterError, RouterResult, ShardId};
use pos_store::{ConnectOptions, ConnectionUri, DriverError, DriverErrorKind, ShardDatabase, ShardDriver};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection yet, or the last attempt failed
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// A connection is cached
    Connected,
    /// Closed by [`ShardRegistry::close_all`]; the next lookup reconnects
    Closed,
}

/// A live shard connection handed out to callers
#[derive(Clone)]
pub struct ShardConnection {
    /// Shard id
    pub id: ShardId,
    /// Database name (`{prefix}_{id}`)
    pub name: String,
    handle: Arc<dyn ShardDatabase>,
}

impl ShardConnection {
    /// Underlying database connection
    pub fn database(&self) -> &Arc<dyn ShardDatabase> {
        &self.handle
    }

    /// Whether the same underlying connection backs both
    pub fn same_connection(&self, other: &ShardConnection) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("live", &self.handle.is_live())
            .finish()
    }
}

/// Per-shard slot
struct ShardSlot {
    id: ShardId,
    name: String,
    /// Serializes connect attempts so concurrent callers share one result
    connect_lock: tokio::sync::Mutex<()>,
    state: RwLock<ConnectionState>,
    conn: RwLock<Option<Arc<dyn ShardDatabase>>>,
}

impl ShardSlot {
    fn live(&self) -> Option<ShardConnection> {
        let conn = self.conn.read();
        match conn.as_ref() {
            Some(db) if db.is_live() => Some(ShardConnection {
                id: self.id,
                name: self.name.clone(),
                handle: db.clone(),
            }),
            _ => None,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

/// Per-shard health report
#[derive(Debug, Clone)]
pub struct ShardHealth {
    /// Shard id
    pub shard_id: ShardId,
    /// Database name
    pub name: String,
    /// Slot state at report time
    pub state: ConnectionState,
    /// Whether the cached connection answered a ping
    pub reachable: bool,
}

/// Registry counters
#[derive(Debug, Clone, Default)]
pub struct ShardRegistryStats {
    /// Live cached connections
    pub cached_connections: usize,
    /// Driver connect calls, retries included
    pub connect_attempts: u64,
    /// Attempts repeated after a transient failure
    pub retries: u64,
    /// Connects that gave up
    pub failures: u64,
    /// Dead connections dropped from their slot
    pub evictions: u64,
}

/// Shard connection registry
pub struct ShardRegistry {
    config: Arc<RouterConfig>,
    base_uri: ConnectionUri,
    driver: Arc<dyn ShardDriver>,
    slots: Vec<ShardSlot>,
    connect_attempts: AtomicCounter,
    retries: AtomicCounter,
    failures: AtomicCounter,
    evictions: AtomicCounter,
}

impl ShardRegistry {
    /// Create registry; fails on a malformed base connection string
    pub fn new(config: Arc<RouterConfig>, driver: Arc<dyn ShardDriver>) -> RouterResult<Self> {
        config.validate()?;
        let base_uri = ConnectionUri::parse(&config.base_uri)
            .map_err(|e| RouterError::Configuration(format!("base connection string: {}", e.message)))?;

        let slots = (1..=config.shard_count)
            .map(|raw| {
                let id = ShardId::from_raw(raw);
                ShardSlot {
                    id,
                    name: config.database_name(id),
                    connect_lock: tokio::sync::Mutex::new(()),
                    state: RwLock::new(ConnectionState::Disconnected),
                    conn: RwLock::new(None),
                }
            })
            .collect();

        tracing::info!(
            shards = config.shard_count,
            hosts = base_uri.hosts(),
            "Shard registry initialized"
        );

        Ok(Self {
            config,
            base_uri,
            driver,
            slots,
            connect_attempts: AtomicCounter::new(0),
            retries: AtomicCounter::new(0),
            failures: AtomicCounter::new(0),
            evictions: AtomicCounter::new(0),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Configured shard count (N)
    pub fn shard_count(&self) -> u16 {
        self.config.shard_count
    }

    /// All shard ids in order
    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.slots.iter().map(|s| s.id)
    }

    /// Check that a shard id lies in `[1, N]`
    pub fn validate(&self, shard: ShardId) -> RouterResult<()> {
        self.slot(shard).map(|_| ())
    }

    fn slot(&self, shard: ShardId) -> RouterResult<&ShardSlot> {
        ShardId::new(shard.get(), self.config.shard_count)?;
        Ok(&self.slots[usize::from(shard.get()) - 1])
    }

    /// Database name for a shard
    pub fn database_name(&self, shard: ShardId) -> RouterResult<String> {
        Ok(self.slot(shard)?.name.clone())
    }

    /// Cached live connection, connecting only if needed
    pub async fn connection_for(&self, shard: ShardId) -> RouterResult<ShardConnection> {
        let slot = self.slot(shard)?;
        if let Some(conn) = slot.live() {
            return Ok(conn);
        }
        self.connect(shard).await
    }

    /// Live connection for `shard`, establishing one if none is cached or
    /// the cached one is no longer connected.
    ///
    /// Concurrent callers for the same shard wait on one attempt and share
    /// its result.
    pub async fn connect(&self, shard: ShardId) -> RouterResult<ShardConnection> {
        let slot = self.slot(shard)?;
        let _guard = slot.connect_lock.lock().await;

        if let Some(conn) = slot.live() {
            return Ok(conn);
        }

        if slot.conn.write().take().is_some() {
            self.evictions.inc();
            tracing::warn!(shard_id = %shard, database = %slot.name, "Evicting dead shard connection");
        }

        slot.set_state(ConnectionState::Connecting);
        match self.connect_with_retry(slot).await {
            Ok(db) => {
                *slot.conn.write() = Some(db.clone());
                slot.set_state(ConnectionState::Connected);
                Ok(ShardConnection {
                    id: slot.id,
                    name: slot.name.clone(),
                    handle: db,
                })
            }
            Err(e) => {
                slot.set_state(ConnectionState::Disconnected);
                self.failures.inc();
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect) bounded by a caller deadline
    pub async fn connect_within(&self, shard: ShardId, deadline: Duration) -> RouterResult<ShardConnection> {
        match tokio::time::timeout(deadline, self.connect(shard)).await {
            Ok(result) => result,
            Err(_) => {
                if let Ok(slot) = self.slot(shard) {
                    // A held lock means another caller is still connecting and owns the state
                    if let Ok(_guard) = slot.connect_lock.try_lock() {
                        if slot.live().is_none() && *slot.state.read() == ConnectionState::Connecting {
                            slot.set_state(ConnectionState::Disconnected);
                        }
                    }
                }
                Err(RouterError::connection(
                    Some(shard),
                    0,
                    format!("caller deadline of {:?} exceeded", deadline),
                ))
            }
        }
    }

    async fn connect_with_retry(&self, slot: &ShardSlot) -> RouterResult<Arc<dyn ShardDatabase>> {
        let uri = self.base_uri.with_database(&slot.name);
        let options = ConnectOptions {
            server_selection_timeout: self.config.server_selection_timeout(),
            socket_timeout: self.config.socket_timeout(),
        };
        let policy = &self.config.retry;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.connect_attempts.inc();

            let result = match tokio::time::timeout(
                options.server_selection_timeout,
                self.driver.connect(&uri, &options),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DriverError::new(
                    DriverErrorKind::Timeout,
                    format!("server selection timed out after {:?}", options.server_selection_timeout),
                )),
            };

            match result {
                Ok(db) => {
                    tracing::info!(
                        shard_id = %slot.id,
                        database = %slot.name,
                        attempt,
                        "Connected to shard"
                    );
                    return Ok(db);
                }
                Err(e) if e.kind == DriverErrorKind::InvalidUri => {
                    return Err(RouterError::Configuration(format!(
                        "connection string for {}: {}",
                        slot.name, e.message
                    )));
                }
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff_after(attempt);
                    self.retries.inc();
                    tracing::warn!(
                        shard_id = %slot.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Shard connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        shard_id = %slot.id,
                        uri = %uri.redacted(),
                        attempt,
                        error = %e,
                        "Shard connect failed"
                    );
                    return Err(RouterError::connection(Some(slot.id), attempt, e.to_string()));
                }
            }
        }
    }

    /// Number of cached connections that are still live
    pub fn count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.conn.read().as_ref().is_some_and(|db| db.is_live()))
            .count()
    }

    /// Current state of a shard's slot
    pub fn state(&self, shard: ShardId) -> RouterResult<ConnectionState> {
        Ok(*self.slot(shard)?.state.read())
    }

    /// Ping every cached connection
    pub async fn health(&self) -> Vec<ShardHealth> {
        let mut report = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let conn = slot.conn.read().clone();
            let reachable = match conn {
                Some(db) => db.ping().await.is_ok(),
                None => false,
            };
            report.push(ShardHealth {
                shard_id: slot.id,
                name: slot.name.clone(),
                state: *slot.state.read(),
                reachable,
            });
        }
        report
    }

    /// Close every cached connection (process shutdown)
    pub async fn close_all(&self) {
        for slot in &self.slots {
            let _guard = slot.connect_lock.lock().await;
            let conn = slot.conn.write().take();
            if let Some(db) = conn {
                db.close().await;
                tracing::info!(shard_id = %slot.id, database = %slot.name, "Closed shard connection");
            }
            slot.set_state(ConnectionState::Closed);
        }
    }

    /// Counters for observability
    pub fn stats(&self) -> ShardRegistryStats {
        ShardRegistryStats {
            cached_connections: self.count(),
            connect_attempts: self.connect_attempts.get(),
            retries: self.retries.get(),
            failures: self.failures.get(),
            evictions: self.evictions.get(),
        }
    }
}
