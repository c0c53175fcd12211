//! Document session for docmodel.
//!
//! `docmodel-session` is the **unit-of-work layer**. It loads, queries, stores
//! and deletes entities on behalf of one caller, keeps one in-memory instance
//! per document key, and sends every pending change in a single batch.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: ensures a single in-memory instance per document key.
//! - **Snapshot cache**: turns tracked entities into canonical documents for
//!   change detection and saving.
//! - **Multi-load merge**: rebuilds positional results for duplicate or
//!   missing ids.
//! - **Query resolver**: re-sends queries while results are stale or
//!   non-authoritative, within their timeouts.
//! - **Lazy scheduler**: collects deferred reads and sends them in one round
//!   trip when the first value is needed.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing reaches the server before
//!   `save_changes`.
//! - **Ownership clarity**: the session owns its transport and is used by one
//!   task at a time.
//! - **Type erasure**: the identity map stores `Box<dyn Any>` for
//!   heterogeneous entity types.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome` via
//!   `docmodel-core`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(transport, conventions);
//!
//! // Same instance on every load of a key
//! let user = session.load::<User>(&cx, "users/1").await?;
//!
//! // Stored entities get a key and are saved on the next save_changes
//! let order = session.store(Order { id: None, total: 10 })?;
//!
//! // Queries
//! let mut adults = session.query::<User>().where_greater_than("Age", 17)?;
//! let found = session.to_list(&cx, &mut adults).await?;
//!
//! session.save_changes(&cx).await?;
//! ```

macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            ::asupersync::Outcome::Ok(value) => value,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub(crate) use try_outcome;
pub(crate) use try_result;

pub mod change_tracker;
pub mod identity_map;
pub mod lazy;
pub mod multi_load;
pub mod query;
pub mod snapshot_cache;

#[cfg(test)]
mod testing;

pub use change_tracker::{ChangeKind, DocumentChange};
pub use identity_map::{EntityReadGuard, EntityRef, EntityWriteGuard, IdentityMap, TrackedEntry};
pub use lazy::{Lazy, LazyOperation, LazyStep};
pub use multi_load::{LoadVerdict, MultiLoadOperation, Positions};
pub use snapshot_cache::{CachingScope, SnapshotCache, hydrate};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use asupersync::{Cx, Outcome};
use docmodel_core::constants::{METADATA_COLLECTION, METADATA_ETAG, METADATA_ID, METADATA_RUST_TYPE};
use docmodel_core::{
    BatchCommand, BatchResult, Command, Conventions, Document, Entity, Error, Etag,
    IdentityConflictKind, Response, Result, Transport, TransportError, TransportErrorKind,
    entity_to_json, identity_is_unset,
};
use serde_json::{Map, Value as JsonValue};

use crate::identity_map::normalize_key;
use crate::multi_load::unexpected_response;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether loaded and queried entities enter the identity map.
    pub tracking_enabled: bool,
    /// Whether queries may be answered from the server's result cache.
    pub caching_enabled: bool,
    /// Accept non-authoritative reads instead of re-requesting them.
    pub allow_non_authoritative: bool,
    /// How long to re-request non-authoritative reads.
    /// Falls back to the conventions when `None`.
    pub non_authoritative_timeout: Option<Duration>,
    /// Send expected etags with puts and deletes of loaded documents.
    pub use_optimistic_concurrency: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tracking_enabled: true,
            caching_enabled: true,
            allow_non_authoritative: false,
            non_authoritative_timeout: None,
            use_optimistic_concurrency: false,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn tracking_enabled(mut self, value: bool) -> Self {
        self.tracking_enabled = value;
        self
    }

    #[must_use]
    pub fn caching_enabled(mut self, value: bool) -> Self {
        self.caching_enabled = value;
        self
    }

    #[must_use]
    pub fn allow_non_authoritative(mut self, value: bool) -> Self {
        self.allow_non_authoritative = value;
        self
    }

    #[must_use]
    pub fn non_authoritative_timeout(mut self, timeout: Duration) -> Self {
        self.non_authoritative_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn use_optimistic_concurrency(mut self, value: bool) -> Self {
        self.use_optimistic_concurrency = value;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of work against one document store.
///
/// Not shared between tasks: every operation takes `&mut self`.
pub struct Session<Tr: Transport> {
    id: u64,
    transport: Tr,
    conventions: Arc<Conventions>,
    config: SessionConfig,
    identity_map: IdentityMap,
    snapshots: SnapshotCache,
    /// Keys deleted by id without being loaded, keyed by lower-cased key.
    pending_deletes: BTreeMap<String, String>,
    lazy_operations: Vec<Box<dyn LazyOperation<Tr>>>,
    number_of_requests: usize,
}

impl<Tr: Transport> std::fmt::Debug for Session<Tr> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport.identifier())
            .field("config", &self.config)
            .field("tracked", &self.identity_map.len())
            .field("pending_deletes", &self.pending_deletes.len())
            .field("lazy_operations", &self.lazy_operations.len())
            .field("number_of_requests", &self.number_of_requests)
            .finish()
    }
}

impl<Tr: Transport> Session<Tr> {
    pub fn new(transport: Tr, conventions: Arc<Conventions>) -> Self {
        Self::with_config(transport, conventions, SessionConfig::default())
    }

    pub fn with_config(transport: Tr, conventions: Arc<Conventions>, config: SessionConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, server = transport.identifier(), "Opening session");
        Self {
            id,
            transport,
            conventions,
            config,
            identity_map: IdentityMap::new(),
            snapshots: SnapshotCache::new(),
            pending_deletes: BTreeMap::new(),
            lazy_operations: Vec::new(),
            number_of_requests: 0,
        }
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conventions(&self) -> &Arc<Conventions> {
        &self.conventions
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Tr {
        &self.transport
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub(crate) fn identity_map_mut(&mut self) -> &mut IdentityMap {
        &mut self.identity_map
    }

    /// Requests made so far. Retries of a stale or non-authoritative read
    /// are not counted.
    pub fn number_of_requests(&self) -> usize {
        self.number_of_requests
    }

    pub(crate) fn non_authoritative_timeout(&self) -> Duration {
        self.config
            .non_authoritative_timeout
            .unwrap_or(self.conventions.non_authoritative_timeout)
    }

    fn optimistic_concurrency(&self) -> bool {
        self.config.use_optimistic_concurrency || self.conventions.use_optimistic_concurrency
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Send one command, counting it against the session's request budget.
    pub(crate) async fn send(&mut self, cx: &Cx, command: &Command) -> Outcome<Response, Error> {
        if let Some(reason) = cx.cancel_reason() {
            tracing::debug!(session = self.id, "Request cancelled before sending");
            return Outcome::Cancelled(reason);
        }
        let budget = self.conventions.max_requests_per_session;
        if self.number_of_requests >= budget {
            return Outcome::Err(Error::InvalidSessionState(format!(
                "the maximum number of requests ({budget}) allowed for this session has been reached"
            )));
        }
        self.number_of_requests += 1;
        tracing::debug!(
            session = self.id,
            command = command.kind(),
            request = self.number_of_requests,
            "Sending command"
        );
        self.dispatch(cx, command).await
    }

    /// Send `command` again after the retry pause, for a read whose previous
    /// answer was stale or non-authoritative. Not counted against the
    /// request budget.
    pub(crate) async fn resend(&self, cx: &Cx, command: &Command) -> Outcome<Response, Error> {
        let delay = self.conventions.retry_delay;
        if !delay.is_zero() {
            let now = cx
                .timer_driver()
                .map_or_else(asupersync::time::wall_now, |driver| driver.now());
            asupersync::time::sleep(now, delay).await;
        }
        if let Some(reason) = cx.cancel_reason() {
            tracing::debug!(session = self.id, "Retry cancelled before sending");
            return Outcome::Cancelled(reason);
        }
        tracing::debug!(
            session = self.id,
            command = command.kind(),
            delay_ms = delay.as_millis() as u64,
            "Re-sending command"
        );
        self.dispatch(cx, command).await
    }

    async fn dispatch(&self, cx: &Cx, command: &Command) -> Outcome<Response, Error> {
        match self.transport.execute(cx, command).await {
            Outcome::Ok(Response::Error { status, message }) => {
                Outcome::Err(Error::Transport(TransportError {
                    kind: TransportErrorKind::Server,
                    message,
                    status: Some(status),
                    source: None,
                }))
            }
            other => other,
        }
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// The entity for a document the server returned under `key`.
    ///
    /// An already tracked key yields the tracked instance; otherwise the
    /// document is converted and, unless tracking is disabled, tracked with
    /// the document as its original.
    pub(crate) fn track_document<T: Entity>(
        &mut self,
        key: &str,
        document: &Document,
    ) -> Result<EntityRef<T>> {
        if let Some(existing) = self.identity_map.get::<T>(key)? {
            return Ok(existing);
        }
        let identity = self.conventions.identity_property::<T>();
        let body = document.body();
        let entity: T = hydrate(Some(key), body.clone(), identity.as_deref())?;
        if !self.config.tracking_enabled {
            return Ok(Arc::new(RwLock::new(entity)));
        }

        let mapped = entity_to_json(&entity, Some(key))?;
        self.snapshots.remember_unmapped(key, &body, &mapped);
        let metadata = document.metadata().cloned().unwrap_or_default();
        let entity = Arc::new(RwLock::new(entity));
        self.identity_map.insert(TrackedEntry::new(
            key,
            Arc::clone(&entity),
            document.clone(),
            metadata,
            identity,
        ))?;
        Ok(entity)
    }

    pub(crate) fn ensure_not_deleted<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        for id in ids {
            if self.is_marked_for_deletion(id) {
                return Err(Error::identity_conflict(IdentityConflictKind::LoadDeleted, id));
            }
        }
        Ok(())
    }

    fn is_marked_for_deletion(&self, key: &str) -> bool {
        self.pending_deletes.contains_key(&normalize_key(key))
            || self.identity_map.entry(key).is_some_and(|entry| entry.deleted)
    }

    // ========================================================================
    // Store and Delete
    // ========================================================================

    /// Start tracking a new entity; it is written on the next save.
    ///
    /// The key comes from the entity's identity property when set, otherwise
    /// conventions generate one and write it back into the entity.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn store<T: Entity>(&mut self, entity: T) -> Result<EntityRef<T>> {
        self.store_internal(entity, None)
    }

    /// Start tracking a new entity under an explicit key.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn store_with_id<T: Entity>(&mut self, entity: T, id: &str) -> Result<EntityRef<T>> {
        self.store_internal(entity, Some(id))
    }

    fn store_internal<T: Entity>(&mut self, entity: T, id: Option<&str>) -> Result<EntityRef<T>> {
        let collection = self.conventions.collection_name::<T>();
        let identity = self.conventions.identity_property::<T>();
        let mut body = entity_to_json(&entity, id)?;

        let key = match id {
            Some(id) => id.to_string(),
            None => identity
                .as_deref()
                .and_then(|property| body.get(property))
                .and_then(|value| self.conventions.document_key_from_identity(&collection, value))
                .unwrap_or_else(|| self.conventions.generate_document_key(&collection)),
        };

        if self.is_marked_for_deletion(&key) {
            return Err(Error::identity_conflict(IdentityConflictKind::StoreDeleted, key));
        }
        if self.identity_map.contains(&key) {
            return Err(Error::identity_conflict(IdentityConflictKind::KeyTaken, key));
        }

        let entity = match identity.as_deref() {
            Some(property) if id.is_some() || identity_is_unset(&body, property) => {
                let numeric = matches!(body.get(property), Some(JsonValue::Number(_)));
                if !numeric {
                    body.remove(property);
                }
                hydrate(Some(&key), body, Some(property))?
            }
            _ => entity,
        };

        let mut metadata = Map::new();
        metadata.insert(METADATA_ID.to_string(), JsonValue::String(key.clone()));
        metadata.insert(METADATA_COLLECTION.to_string(), JsonValue::String(collection));
        metadata.insert(
            METADATA_RUST_TYPE.to_string(),
            JsonValue::String(std::any::type_name::<T>().to_string()),
        );

        let entity = Arc::new(RwLock::new(entity));
        self.identity_map.insert(
            TrackedEntry::new(&key, Arc::clone(&entity), Document::new(), metadata, identity)
                .mark_new(),
        )?;
        tracing::debug!(key = %key, "Stored new entity");
        Ok(entity)
    }

    /// Mark a tracked entity for deletion on the next save.
    ///
    /// An entity stored in this session and never saved is simply forgotten.
    pub fn delete<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        let Some(entry) = self.identity_map.entry_for_mut(entity) else {
            return Err(Error::InvalidSessionState(
                "entity is not associated with the session, cannot delete unknown entity instance"
                    .to_string(),
            ));
        };
        let key = entry.key().to_string();
        if entry.is_new {
            self.identity_map.remove(&key);
            self.snapshots.forget(&key);
            tracing::debug!(key = %key, "Forgot unsaved entity");
            return Ok(());
        }
        entry.deleted = true;
        tracing::debug!(key = %key, "Marked entity for deletion");
        Ok(())
    }

    /// Delete a document by key on the next save.
    ///
    /// Fails when the key is tracked and the entity has unsaved changes.
    pub fn delete_by_id(&mut self, key: &str) -> Result<()> {
        if let Some(entry) = self.identity_map.entry(key) {
            if entry.deleted {
                return Ok(());
            }
            if self.entry_has_changed(entry)? {
                return Err(Error::identity_conflict(
                    IdentityConflictKind::DeleteModified,
                    entry.key(),
                ));
            }
            if let Some(entry) = self.identity_map.entry_mut(key) {
                entry.deleted = true;
            }
            tracing::debug!(key, "Marked tracked key for deletion");
            return Ok(());
        }
        self.identity_map.take_included(key);
        self.pending_deletes
            .insert(normalize_key(key), key.to_string());
        tracing::debug!(key, "Marked untracked key for deletion");
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Whether `key` is tracked (and not deleted) or was delivered as an
    /// include.
    pub fn is_loaded(&self, key: &str) -> bool {
        self.identity_map
            .entry(key)
            .is_some_and(|entry| !entry.deleted)
            || self.identity_map.is_included(key)
    }

    /// Whether `key` is marked for deletion or known not to exist.
    pub fn is_deleted(&self, key: &str) -> bool {
        self.is_marked_for_deletion(key) || self.identity_map.is_missing(key)
    }

    /// Key of a tracked entity.
    pub fn key_for<T: Entity>(&self, entity: &EntityRef<T>) -> Option<String> {
        self.identity_map
            .entry_for(entity)
            .map(|entry| entry.key().to_string())
    }

    /// Etag of a tracked entity as last seen on the server.
    pub fn etag_for<T: Entity>(&self, entity: &EntityRef<T>) -> Result<Option<Etag>> {
        self.identity_map
            .entry_for(entity)
            .map(|entry| entry.etag)
            .ok_or_else(|| Error::InvalidSessionState("entity is not tracked by this session".into()))
    }

    /// Metadata of a tracked entity.
    pub fn metadata_for<T: Entity>(&self, entity: &EntityRef<T>) -> Result<&Map<String, JsonValue>> {
        self.identity_map
            .entry_for(entity)
            .map(|entry| &entry.metadata)
            .ok_or_else(|| Error::InvalidSessionState("entity is not tracked by this session".into()))
    }

    /// Stop tracking an entity. Its changes are not saved.
    pub fn evict<T: Entity>(&mut self, entity: &EntityRef<T>) {
        if let Some(key) = self.key_for(entity) {
            self.identity_map.remove(&key);
            self.snapshots.forget(&key);
            tracing::debug!(key = %key, "Evicted entity");
        }
    }

    /// Forget every tracked entity, include and pending deletion.
    pub fn clear(&mut self) {
        self.identity_map.clear();
        self.snapshots.clear();
        self.pending_deletes.clear();
    }

    fn entry_has_changed(&self, entry: &TrackedEntry) -> Result<bool> {
        if entry.is_new || entry.deleted {
            return Ok(true);
        }
        let current = self.snapshots.to_document(entry)?;
        Ok(change_tracker::is_dirty(&entry.original, &current))
    }

    /// Whether anything would be sent by `save_changes`.
    pub fn has_changes(&self) -> Result<bool> {
        if !self.pending_deletes.is_empty() {
            return Ok(true);
        }
        for entry in self.identity_map.iter() {
            if self.entry_has_changed(entry)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether a tracked entity differs from what the server last returned.
    pub fn has_changed<T: Entity>(&self, entity: &EntityRef<T>) -> Result<bool> {
        match self.identity_map.entry_for(entity) {
            Some(entry) => self.entry_has_changed(entry),
            None => Err(Error::InvalidSessionState(
                "entity is not tracked by this session".into(),
            )),
        }
    }

    /// Changes per document key.
    pub fn what_changed(&self) -> Result<BTreeMap<String, Vec<DocumentChange>>> {
        let mut changes = BTreeMap::new();
        for key in self.pending_deletes.values() {
            changes.insert(
                key.clone(),
                vec![DocumentChange::whole_document(ChangeKind::DocumentDeleted)],
            );
        }
        for entry in self.identity_map.iter() {
            let found = if entry.deleted {
                vec![DocumentChange::whole_document(ChangeKind::DocumentDeleted)]
            } else if entry.is_new {
                vec![DocumentChange::whole_document(ChangeKind::NewDocument)]
            } else {
                change_tracker::diff(&entry.original, &self.snapshots.to_document(entry)?)
            };
            if !found.is_empty() {
                changes.insert(entry.key().to_string(), found);
            }
        }
        Ok(changes)
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Send every pending put and delete in one batch.
    ///
    /// Returns the number of commands sent. Nothing is sent when there are no
    /// changes.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.id))]
    pub async fn save_changes(&mut self, cx: &Cx) -> Outcome<usize, Error> {
        let scope = try_result!(self.snapshots.begin_caching_scope());
        let (commands, written) = try_result!(self.prepare_batch());
        if commands.is_empty() {
            tracing::debug!("No changes to save");
            return Outcome::Ok(0);
        }

        let count = commands.len();
        tracing::debug!(commands = count, "Saving changes");
        let response = try_outcome!(self.send(cx, &Command::Batch(commands.clone())).await);
        let results = match response {
            Response::Batch(results) => results,
            other => return Outcome::Err(unexpected_response("batch", &other)),
        };
        try_result!(self.apply_batch(&commands, &results, written));
        drop(scope);

        tracing::info!(commands = count, "Saved changes");
        Outcome::Ok(count)
    }

    fn prepare_batch(&self) -> Result<(Vec<BatchCommand>, HashMap<String, Document>)> {
        let optimistic = self.optimistic_concurrency();
        let mut commands = Vec::new();
        let mut written = HashMap::new();

        for key in self.pending_deletes.values() {
            commands.push(BatchCommand::Delete {
                key: key.clone(),
                etag: None,
            });
        }

        for key in self.identity_map.keys() {
            let Some(entry) = self.identity_map.entry(&key) else {
                continue;
            };
            let expected = if optimistic && !entry.is_new {
                entry.etag
            } else {
                None
            };
            if entry.deleted {
                commands.push(BatchCommand::Delete { key, etag: expected });
                continue;
            }
            let document = self.snapshots.to_document(entry)?;
            if entry.is_new || change_tracker::is_dirty(&entry.original, &document) {
                written.insert(normalize_key(&key), document.clone());
                commands.push(BatchCommand::Put {
                    key,
                    document,
                    etag: expected,
                });
            }
        }
        Ok((commands, written))
    }

    fn apply_batch(
        &mut self,
        commands: &[BatchCommand],
        results: &[BatchResult],
        mut written: HashMap<String, Document>,
    ) -> Result<()> {
        let etags: HashMap<String, Option<Etag>> = results
            .iter()
            .map(|result| (normalize_key(&result.key), result.etag))
            .collect();

        for command in commands {
            match command {
                BatchCommand::Delete { key, .. } => {
                    self.identity_map.remove(key);
                    self.snapshots.forget(key);
                    self.identity_map.register_missing(key);
                }
                BatchCommand::Put { key, .. } => {
                    let normalized = normalize_key(key);
                    let etag = etags.get(&normalized).copied().flatten();
                    let Some(saved) = written.remove(&normalized) else {
                        continue;
                    };
                    let Some(entry) = self.identity_map.entry_mut(key) else {
                        continue;
                    };
                    let mut original = saved.snapshot();
                    if let Some(etag) = etag {
                        entry
                            .metadata
                            .insert(METADATA_ETAG.to_string(), JsonValue::from(etag.0));
                        original.set_metadata(METADATA_ETAG, JsonValue::from(etag.0))?;
                    }
                    entry.etag = etag;
                    entry.original = original.frozen();
                    entry.is_new = false;
                }
            }
        }
        self.pending_deletes.clear();
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
