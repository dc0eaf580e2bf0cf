//! User directory
//!
//! Users live in their store's `{prefix}_users` collection, or in
//! `system_users` for administrators without a store. Login only knows an
//! email or username, so lookups search across tenants:
//!
//! 1. the hinted tenant, or the one remembered in the directory cache
//! 2. the system namespace
//! 3. every registered tenant, in registry order
//!
//! A tenant whose shard cannot be searched is logged and skipped.

use crate::directory_cache::DirectoryCache;
use crate::entities::User;
use crate::factory::ModelFactory;
use crate::handle::CollectionHandle;
use crate::resolver::TenantResolver;
use crate::schema::EntityKind;
use chrono::{Duration as ChronoDuration, Utc};
use pos_common::{normalize_key, AtomicCounter, Namespace, RouterError, RouterResult, ShardId, TenantPrefix};
use pos_store::Filter;
use std::collections::HashMap;
use std::sync::Arc;

/// Login lookup by email and/or username
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserQuery {
    /// Normalized email
    pub email: Option<String>,
    /// Normalized username
    pub username: Option<String>,
}

impl UserQuery {
    /// Query on either or both keys; blank keys are dropped
    pub fn new(email: Option<&str>, username: Option<&str>) -> Self {
        let clean = |v: Option<&str>| v.map(normalize_key).filter(|v| !v.is_empty());
        Self {
            email: clean(email),
            username: clean(username),
        }
    }

    /// Query by email only
    pub fn by_email(email: &str) -> Self {
        Self::new(Some(email), None)
    }

    /// Query by username only
    pub fn by_username(username: &str) -> Self {
        Self::new(None, Some(username))
    }

    /// Store filter; matches either key when both are set
    pub fn filter(&self) -> RouterResult<Filter> {
        let mut filters: Vec<Filter> = Vec::with_capacity(2);
        if let Some(email) = &self.email {
            filters.push(Filter::eq("email", email.as_str()));
        }
        if let Some(username) = &self.username {
            filters.push(Filter::eq("username", username.as_str()));
        }
        match filters.len() {
            0 => Err(RouterError::validation("user query needs an email or username")),
            1 => Ok(filters.remove(0)),
            _ => Ok(Filter::Or(filters)),
        }
    }

    /// Directory cache keys for this query
    pub fn cache_keys(&self) -> impl Iterator<Item = &str> {
        self.email.as_deref().into_iter().chain(self.username.as_deref())
    }
}

/// Outcome of a duplicate reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Namespaces searched (system included)
    pub namespaces_scanned: usize,
    /// Namespaces skipped because they could not be read
    pub namespaces_failed: usize,
    /// Distinct user ids seen
    pub users_seen: usize,
    /// Stale copies deleted
    pub duplicates_removed: usize,
}

/// Directory counters
#[derive(Debug, Clone, Default)]
pub struct UserDirectoryStats {
    /// Lookups answered through a directory cache hit
    pub cached_lookups: u64,
    /// Lookups answered by the system namespace
    pub system_lookups: u64,
    /// Full tenant scans started
    pub full_scans: u64,
    /// Tenants skipped during a scan because they failed
    pub scan_failures: u64,
    /// Completed migrations
    pub migrations: u64,
    /// Migrations that left a second copy behind
    pub partial_migrations: u64,
}

/// Cross-tenant user directory
pub struct UserDirectory {
    factory: Arc<ModelFactory>,
    cache: Arc<DirectoryCache>,
    system_shard: ShardId,
    cached_lookups: AtomicCounter,
    system_lookups: AtomicCounter,
    full_scans: AtomicCounter,
    scan_failures: AtomicCounter,
    migrations: AtomicCounter,
    partial_migrations: AtomicCounter,
}

impl UserDirectory {
    /// Directory over `factory`, fronted by `cache`
    pub fn new(factory: Arc<ModelFactory>, cache: Arc<DirectoryCache>) -> Self {
        let system_shard = factory.shards().config().system_shard_id();
        Self {
            factory,
            cache,
            system_shard,
            cached_lookups: AtomicCounter::new(0),
            system_lookups: AtomicCounter::new(0),
            full_scans: AtomicCounter::new(0),
            scan_failures: AtomicCounter::new(0),
            migrations: AtomicCounter::new(0),
            partial_migrations: AtomicCounter::new(0),
        }
    }

    /// Directory cache in front of the lookups
    pub fn cache(&self) -> &Arc<DirectoryCache> {
        &self.cache
    }

    fn resolver(&self) -> &Arc<TenantResolver> {
        self.factory.resolver()
    }

    /// Users handle for a store, or the system namespace for `None`
    pub async fn get_user_handle(&self, tenant: Option<&str>) -> RouterResult<Arc<CollectionHandle>> {
        match tenant {
            None => self.system_handle().await,
            Some(tenant) => self.factory.get_handle_for_tenant(tenant, EntityKind::User).await,
        }
    }

    async fn system_handle(&self) -> RouterResult<Arc<CollectionHandle>> {
        self.factory
            .handle_for(Namespace::System, self.system_shard, EntityKind::User)
            .await
    }

    async fn tenant_handle(&self, prefix: &TenantPrefix, shard: ShardId) -> RouterResult<Arc<CollectionHandle>> {
        self.factory
            .handle_for(Namespace::Tenant(prefix.clone()), shard, EntityKind::User)
            .await
    }

    /// Plain lookup in one namespace (no cache, no fallback)
    pub async fn find_in_tenant(&self, tenant: Option<&str>, query: &UserQuery) -> RouterResult<Option<User>> {
        let filter = query.filter()?;
        self.get_user_handle(tenant).await?.find_one(&filter).await
    }

    /// Find a user by email/username anywhere
    pub async fn find_across_tenants(&self, query: &UserQuery, hint: Option<&str>) -> RouterResult<Option<User>> {
        let filter = query.filter()?;

        let first = match hint {
            Some(hint) => Some(hint.to_string()),
            None => query.cache_keys().find_map(|key| self.cache.get(key)),
        };

        let mut tried: Option<TenantPrefix> = None;
        if let Some(tenant) = first {
            match self.resolver().resolve_with_shard(&tenant).await {
                Ok((placement, shard)) => {
                    tried = Some(placement.prefix.clone());
                    match self.search_tenant(&placement.prefix, shard, &filter).await {
                        Ok(Some(user)) => {
                            self.cached_lookups.inc();
                            self.remember(&user);
                            return Ok(Some(user));
                        }
                        Ok(None) => {}
                        Err(e) => self.scan_failed(placement.prefix.as_str(), shard, &e),
                    }
                }
                Err(e) => {
                    tracing::debug!(tenant = %tenant, error = %e, "Hinted tenant not resolvable");
                }
            }
        }

        match self.search_system(&filter).await {
            Ok(Some(user)) => {
                self.system_lookups.inc();
                return Ok(Some(user));
            }
            Ok(None) => {}
            Err(e) => self.scan_failed("system", self.system_shard, &e),
        }

        self.full_scans.inc();
        let records = self.resolver().registry().list_all().await?;
        for record in records {
            if tried.as_ref() == Some(&record.prefix) {
                continue;
            }
            match self.search_tenant(&record.prefix, record.shard_id, &filter).await {
                Ok(Some(user)) => {
                    tracing::debug!(tenant = %record.prefix, user_id = %user.id, "User found by full scan");
                    self.remember(&user);
                    return Ok(Some(user));
                }
                Ok(None) => {}
                Err(e) => self.scan_failed(record.prefix.as_str(), record.shard_id, &e),
            }
        }

        Ok(None)
    }

    /// Find a user by id; with a tenant, search only that tenant
    pub async fn find_by_id_across_tenants(&self, user_id: &str, tenant: Option<&str>) -> RouterResult<Option<User>> {
        if let Some(tenant) = tenant {
            let found: Option<User> = self.get_user_handle(Some(tenant)).await?.find_by_id(user_id).await?;
            if let Some(user) = &found {
                self.remember(user);
            }
            return Ok(found);
        }

        let by_id = Filter::by_id(user_id);
        match self.search_system(&by_id).await {
            Ok(Some(user)) => return Ok(Some(user)),
            Ok(None) => {}
            Err(e) => self.scan_failed("system", self.system_shard, &e),
        }

        for record in self.resolver().registry().list_all().await? {
            match self.search_tenant(&record.prefix, record.shard_id, &by_id).await {
                Ok(Some(user)) => {
                    self.remember(&user);
                    return Ok(Some(user));
                }
                Ok(None) => {}
                Err(e) => self.scan_failed(record.prefix.as_str(), record.shard_id, &e),
            }
        }
        Ok(None)
    }

    async fn search_system(&self, filter: &Filter) -> RouterResult<Option<User>> {
        self.system_handle().await?.find_one(filter).await
    }

    async fn search_tenant(&self, prefix: &TenantPrefix, shard: ShardId, filter: &Filter) -> RouterResult<Option<User>> {
        self.tenant_handle(prefix, shard).await?.find_one(filter).await
    }

    fn scan_failed(&self, tenant: &str, shard: ShardId, err: &RouterError) {
        self.scan_failures.inc();
        tracing::warn!(
            tenant = %tenant,
            shard_id = %shard,
            error = %err,
            "Skipping tenant in cross-tenant user search"
        );
    }

    fn remember(&self, user: &User) {
        let tenant = user.tenant_id.as_deref();
        self.cache.put(&user.email, tenant);
        self.cache.put(&user.username, tenant);
    }

    /// Create a user in a store (or the system namespace)
    pub async fn create_user(&self, tenant: Option<&str>, mut user: User) -> RouterResult<User> {
        user.username = normalize_key(&user.username);
        user.email = normalize_key(&user.email);

        let handle = match tenant {
            None => {
                user.tenant_id = None;
                self.system_handle().await?
            }
            Some(tenant) => {
                let (placement, shard) = self.resolver().resolve_with_shard(tenant).await?;
                user.tenant_id = placement.store_id.clone();
                self.tenant_handle(&placement.prefix, shard).await?
            }
        };

        handle.insert(&user).await?;
        tracing::info!(
            user_id = %user.id,
            collection = %handle.name(),
            shard_id = %handle.shard_id(),
            "Created user"
        );
        self.remember(&user);
        Ok(user)
    }

    /// Replace a user in place; `updated_at` is refreshed
    pub async fn update_user(&self, user: &User) -> RouterResult<User> {
        let handle = self.get_user_handle(user.tenant_id.as_deref()).await?;
        let previous: User = handle
            .find_by_id(&user.id)
            .await?
            .ok_or_else(|| RouterError::not_found(format!("user '{}'", user.id)))?;

        let mut updated = user.clone();
        updated.username = normalize_key(&updated.username);
        updated.email = normalize_key(&updated.email);
        updated.updated_at = advance(previous.updated_at);

        if !handle.replace(&updated).await? {
            return Err(RouterError::not_found(format!("user '{}'", user.id)));
        }
        self.invalidate_directory_cache(Some(&previous.email), Some(&previous.username));
        self.remember(&updated);
        Ok(updated)
    }

    /// Delete a user from its namespace; false if it was absent
    pub async fn delete_user(&self, tenant: Option<&str>, user_id: &str) -> RouterResult<bool> {
        let handle = self.get_user_handle(tenant).await?;
        let Some(existing) = handle.find_by_id::<User>(user_id).await? else {
            return Ok(false);
        };
        let deleted = handle.delete_by_id(user_id).await?;
        self.invalidate_directory_cache(Some(&existing.email), Some(&existing.username));
        Ok(deleted)
    }

    /// Move a user to another store.
    ///
    /// Not atomic across shards: the copy is created and read back on the
    /// destination before the source is deleted. A copy that cannot be read
    /// back is deleted again and the call fails. If either delete fails the
    /// user exists twice, counted in `partial_migrations`, until
    /// [`reconcile_duplicates`](Self::reconcile_duplicates) removes the older copy.
    pub async fn migrate_user(&self, user: &User, new_tenant: &str) -> RouterResult<User> {
        let source = self.get_user_handle(user.tenant_id.as_deref()).await?;
        let (placement, shard) = self.resolver().resolve_with_shard(new_tenant).await?;
        let destination = self.tenant_handle(&placement.prefix, shard).await?;

        if Arc::ptr_eq(&source, &destination) {
            return Err(RouterError::validation(format!(
                "user '{}' already belongs to '{}'",
                user.id, placement.prefix
            )));
        }

        let mut copy = user.clone();
        copy.tenant_id = placement.store_id.clone();
        copy.updated_at = advance(user.updated_at);

        destination.insert(&copy).await?;
        let verified = match destination.find_by_id::<User>(&copy.id).await {
            Ok(Some(stored)) if stored == copy => Ok(()),
            Ok(_) => Err(RouterError::connection(
                Some(destination.shard_id()),
                1,
                format!("migrated copy of user '{}' not readable in '{}'", copy.id, destination.name()),
            )),
            Err(e) => Err(e),
        };
        if let Err(e) = verified {
            self.discard_unverified_copy(&source, &destination, &copy, &e).await;
            return Err(e);
        }

        match source.delete_by_id(&user.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(user_id = %user.id, collection = %source.name(), "Source user already gone during migration");
            }
            Err(e) => {
                self.partial_migrations.inc();
                tracing::error!(
                    user_id = %user.id,
                    source = %source.name(),
                    source_shard = %source.shard_id(),
                    destination = %destination.name(),
                    error = %e,
                    "Partial migration: user left in source namespace"
                );
            }
        }

        self.invalidate_directory_cache(Some(&user.email), Some(&user.username));
        self.remember(&copy);
        self.migrations.inc();

        tracing::info!(
            user_id = %copy.id,
            from = %source.name(),
            to = %destination.name(),
            "Migrated user"
        );
        Ok(copy)
    }

    async fn discard_unverified_copy(
        &self,
        source: &CollectionHandle,
        destination: &CollectionHandle,
        copy: &User,
        cause: &RouterError,
    ) {
        match destination.delete_by_id(&copy.id).await {
            Ok(_) => {
                tracing::warn!(
                    user_id = %copy.id,
                    destination = %destination.name(),
                    error = %cause,
                    "Migration aborted, unverified copy removed"
                );
            }
            Err(e) => {
                self.partial_migrations.inc();
                tracing::error!(
                    user_id = %copy.id,
                    source = %source.name(),
                    destination = %destination.name(),
                    destination_shard = %destination.shard_id(),
                    cause = %cause,
                    error = %e,
                    "Partial migration: unverified copy left in destination namespace"
                );
            }
        }
    }

    /// Forget the cached owner of an email and username
    pub fn invalidate_directory_cache(&self, email: Option<&str>, username: Option<&str>) {
        self.cache.invalidate_user(email, username);
    }

    /// Remove stale copies left behind by interrupted migrations.
    ///
    /// Users are grouped by id across every namespace; the copy with the
    /// newest `updated_at` is kept.
    pub async fn reconcile_duplicates(&self) -> RouterResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut namespaces: Vec<(String, ShardId, RouterResult<Arc<CollectionHandle>>)> =
            vec![("system".to_string(), self.system_shard, self.system_handle().await)];
        for record in self.resolver().registry().list_all().await? {
            let handle = self.tenant_handle(&record.prefix, record.shard_id).await;
            namespaces.push((record.prefix.to_string(), record.shard_id, handle));
        }

        let mut copies: HashMap<String, Vec<(Arc<CollectionHandle>, User)>> = HashMap::new();
        for (label, shard, handle) in namespaces {
            let listed = match handle {
                Ok(handle) => match handle.find::<User>(&Filter::All).await {
                    Ok(users) => Ok((handle, users)),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match listed {
                Ok((handle, users)) => {
                    report.namespaces_scanned += 1;
                    for user in users {
                        copies.entry(user.id.clone()).or_default().push((handle.clone(), user));
                    }
                }
                Err(e) => {
                    report.namespaces_failed += 1;
                    self.scan_failed(&label, shard, &e);
                }
            }
        }

        report.users_seen = copies.len();
        for (user_id, mut group) in copies {
            if group.len() < 2 {
                continue;
            }
            group.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
            let keeper = group.remove(0);
            for (handle, stale) in group {
                match handle.delete_by_id(&stale.id).await {
                    Ok(_) => {
                        report.duplicates_removed += 1;
                        tracing::info!(
                            user_id = %user_id,
                            removed_from = %handle.name(),
                            kept_in = %keeper.0.name(),
                            "Removed duplicate user"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, collection = %handle.name(), error = %e, "Failed to remove duplicate user");
                    }
                }
            }
            self.remember(&keeper.1);
        }

        Ok(report)
    }

    /// Counters for observability
    pub fn stats(&self) -> UserDirectoryStats {
        UserDirectoryStats {
            cached_lookups: self.cached_lookups.get(),
            system_lookups: self.system_lookups.get(),
            full_scans: self.full_scans.get(),
            scan_failures: self.scan_failures.get(),
            migrations: self.migrations.get(),
            partial_migrations: self.partial_migrations.get(),
        }
    }
}

/// Now, or just after `previous` if the clock has not moved past it
fn advance(previous: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + ChronoDuration::milliseconds(1)
    }
}
