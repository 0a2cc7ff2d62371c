//! # MemoryBackend: Transactional Storage Core
//!
//! Owns every database, connection and backend transaction, and is the only
//! place where record data changes.
//!
//! ## State Layout
//!
//! | Level        | Holds                                                          |
//! |--------------|----------------------------------------------------------------|
//! | database     | committed [`Snapshot`], open connections, writer slot, readers |
//! | connection   | database name, active version-change transaction               |
//! | transaction  | mode, scope, working [`Snapshot`]                              |
//!
//! A snapshot is the schema plus one [`OrderedMap`] per object store and per
//! index. A transaction's working snapshot starts out as a clone of the
//! committed one, which with persistent maps means "a reference to the
//! committed data"; the first write path-copies. Commit swaps the working
//! snapshot in as the new committed state in one assignment, rollback drops
//! it.
//!
//! ## Admission
//!
//! Per database: at most one writer (read-write or version-change). Readers
//! never wait for writers; they read the snapshot that was committed when
//! they began. A version change waits until no other transaction is active,
//! and nothing else starts while it runs. Waiting is cooperative: callers
//! await a [`Notify`] that fires whenever a transaction finishes or a
//! connection closes.
//!
//! Connections, transactions and databases are referenced by opaque ids, so
//! nothing above this module holds pointers into backend state.

mod dump;
mod records;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use crate::config::KEY_GENERATOR_START;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::key_path::KeyPath;
use crate::ordered_map::OrderedMap;
use crate::range::KeyRange;
use crate::schema::Schema;
use crate::value::Value;

pub use dump::{BackendDump, DatabaseDump, IndexDump, ObjectStoreDump};
pub use records::{
    CursorDirection, RecordGetRequest, RecordGetResponse, RecordStoreRequest, ResultLevel,
    StoreLevel,
};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Opaque connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Opaque backend transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

impl TransactionMode {
    pub fn is_write(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

/// Invoked with the database name after every committed write transaction,
/// or after the database was deleted.
pub type CommitHook = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Data of one object store.
#[derive(Clone, Default)]
pub(crate) struct StoreData {
    pub(crate) records: OrderedMap<Key, Value>,
    /// Next auto-increment key. Never decreases, not even on delete.
    pub(crate) key_generator: u64,
}

impl StoreData {
    fn new() -> Self {
        Self {
            records: OrderedMap::new(),
            key_generator: KEY_GENERATOR_START,
        }
    }
}

/// Data of one index: index key -> set of primary keys. Iterating the outer
/// map and then each inner map yields `(index key, primary key)` order.
#[derive(Clone, Default)]
pub(crate) struct IndexData {
    pub(crate) entries: OrderedMap<Key, OrderedMap<Key, ()>>,
}

impl IndexData {
    pub(crate) fn insert(&self, index_key: Key, primary_key: Key, unique: bool) -> StoreResult<Self> {
        let primaries = self.entries.get(&index_key).cloned().unwrap_or_default();
        if unique && !primaries.is_empty() && !primaries.has(&primary_key) {
            return Err(StoreError::constraint(format!(
                "unique index already contains key {:?}",
                index_key
            )));
        }
        Ok(Self {
            entries: self
                .entries
                .inserted(index_key, primaries.inserted(primary_key, ())),
        })
    }

    pub(crate) fn remove(&self, index_key: &Key, primary_key: &Key) -> Self {
        match self.entries.get(index_key) {
            None => self.clone(),
            Some(primaries) => {
                let remaining = primaries.without(primary_key);
                let entries = if remaining.is_empty() {
                    self.entries.without(index_key)
                } else {
                    self.entries.inserted(index_key.clone(), remaining)
                };
                Self { entries }
            }
        }
    }

    /// Number of `(index key, primary key)` pairs.
    pub(crate) fn len(&self) -> usize {
        self.entries.iter().map(|(_, p)| p.len()).sum()
    }
}

/// Schema plus data, either committed or transaction-local.
#[derive(Clone)]
pub(crate) struct Snapshot {
    pub(crate) schema: Schema,
    pub(crate) stores: BTreeMap<String, StoreData>,
    pub(crate) indexes: BTreeMap<String, IndexData>,
}

impl Snapshot {
    fn empty(name: &str) -> Self {
        Self {
            schema: Schema::new(name),
            stores: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend State
// ---------------------------------------------------------------------------

struct DatabaseState {
    committed: Snapshot,
    connections: BTreeSet<ConnectionId>,
    /// Active read-write or version-change transaction.
    writer: Option<TransactionId>,
    version_change: bool,
    readers: usize,
}

impl DatabaseState {
    fn new(name: &str) -> Self {
        Self {
            committed: Snapshot::empty(name),
            connections: BTreeSet::new(),
            writer: None,
            version_change: false,
            readers: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.writer.is_none() && self.readers == 0 && !self.version_change
    }
}

struct ConnectionState {
    database: String,
    version_change: Option<TransactionId>,
}

struct TransactionState {
    connection: ConnectionId,
    database: String,
    mode: TransactionMode,
    scope: BTreeSet<String>,
    working: Snapshot,
}

#[derive(Default)]
struct BackendState {
    databases: HashMap<String, DatabaseState>,
    connections: HashMap<ConnectionId, ConnectionState>,
    transactions: HashMap<TransactionId, TransactionState>,
    next_id: u64,
}

impl BackendState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection(&self, conn: ConnectionId) -> StoreResult<&ConnectionState> {
        self.connections
            .get(&conn)
            .ok_or_else(|| StoreError::invalid_state(format!("{} is closed", conn)))
    }

    fn transaction(&self, tx: TransactionId) -> StoreResult<&TransactionState> {
        self.transactions
            .get(&tx)
            .ok_or_else(|| StoreError::TransactionInactive(format!("{} is finished", tx)))
    }

    fn transaction_mut(&mut self, tx: TransactionId) -> StoreResult<&mut TransactionState> {
        self.transactions
            .get_mut(&tx)
            .ok_or_else(|| StoreError::TransactionInactive(format!("{} is finished", tx)))
    }

    fn version_change_mut(&mut self, tx: TransactionId) -> StoreResult<&mut TransactionState> {
        let state = self.transaction_mut(tx)?;
        if state.mode != TransactionMode::VersionChange {
            return Err(StoreError::invalid_state(
                "schema changes require a version-change transaction",
            ));
        }
        Ok(state)
    }

    /// Release the admission slot held by a finished transaction.
    fn release(&mut self, tx: TransactionId, state: &TransactionState) {
        if let Some(db) = self.databases.get_mut(&state.database) {
            match state.mode {
                TransactionMode::ReadOnly => db.readers = db.readers.saturating_sub(1),
                TransactionMode::ReadWrite => {
                    if db.writer == Some(tx) {
                        db.writer = None;
                    }
                }
                TransactionMode::VersionChange => {
                    if db.writer == Some(tx) {
                        db.writer = None;
                    }
                    db.version_change = false;
                }
            }
        }
        if let Some(conn) = self.connections.get_mut(&state.connection) {
            if conn.version_change == Some(tx) {
                conn.version_change = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// In-memory, multi-database storage backend.
///
/// Shared as `Arc<MemoryBackend>`. All state sits behind one mutex that is
/// never held across an await point.
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    changed: Notify,
    after_commit: RwLock<Option<CommitHook>>,
    after_delete: RwLock<Option<CommitHook>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBackend")
            .field("databases", &state.databases.len())
            .field("connections", &state.connections.len())
            .field("transactions", &state.transactions.len())
            .finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            changed: Notify::new(),
            after_commit: RwLock::new(None),
            after_delete: RwLock::new(None),
        }
    }

    /// Install a hook run after each committed write transaction.
    pub fn set_after_commit(&self, hook: CommitHook) {
        *self.after_commit.write() = Some(hook);
    }

    /// Install a hook run after a database has been deleted.
    pub fn set_after_delete(&self, hook: CommitHook) {
        *self.after_delete.write() = Some(hook);
    }

    /// Re-run `attempt` every time backend state changes until it yields.
    async fn wait_until<T>(
        &self,
        mut attempt: impl FnMut(&mut BackendState) -> Option<StoreResult<T>>,
    ) -> StoreResult<T> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(result) = attempt(&mut state) {
                    return result;
                }
            }
            notified.await;
        }
    }

    // -- Databases and connections ------------------------------------------

    /// Names and committed versions of every known database.
    pub fn database_names(&self) -> Vec<(String, u64)> {
        let state = self.state.lock();
        let mut names: Vec<(String, u64)> = state
            .databases
            .iter()
            .map(|(name, db)| (name.clone(), db.committed.schema.database_version))
            .collect();
        names.sort();
        names
    }

    /// Open a connection, creating an empty version-0 database on first use.
    /// Waits while a version change on the same database is in progress.
    pub async fn connect_database(&self, name: &str) -> StoreResult<ConnectionId> {
        let conn = self
            .wait_until(|state| {
                if state.databases.get(name).map_or(false, |db| db.version_change) {
                    return None;
                }
                let id = ConnectionId(state.next_id());
                state
                    .databases
                    .entry(name.to_string())
                    .or_insert_with(|| DatabaseState::new(name))
                    .connections
                    .insert(id);
                state.connections.insert(
                    id,
                    ConnectionState {
                        database: name.to_string(),
                        version_change: None,
                    },
                );
                Some(Ok(id))
            })
            .await?;
        debug!(database = name, connection = %conn, "connection opened");
        Ok(conn)
    }

    /// Close a connection, rolling back anything it left behind.
    pub fn close_connection(&self, conn: ConnectionId) {
        {
            let mut state = self.state.lock();
            let leftovers: Vec<TransactionId> = state
                .transactions
                .iter()
                .filter(|(_, t)| t.connection == conn)
                .map(|(id, _)| *id)
                .collect();
            for tx in leftovers {
                if let Some(t) = state.transactions.remove(&tx) {
                    state.release(tx, &t);
                }
            }
            if let Some(c) = state.connections.remove(&conn) {
                if let Some(db) = state.databases.get_mut(&c.database) {
                    db.connections.remove(&conn);
                }
            }
        }
        debug!(connection = %conn, "connection closed");
        self.changed.notify_waiters();
    }

    /// Committed schema of the connection's database.
    pub fn schema(&self, conn: ConnectionId) -> StoreResult<Schema> {
        let state = self.state.lock();
        let c = state.connection(conn)?;
        state
            .databases
            .get(&c.database)
            .map(|db| db.committed.schema.clone())
            .ok_or_else(|| StoreError::not_found(format!("database '{}'", c.database)))
    }

    /// Schema as seen from inside a transaction (dirty during a version change).
    pub fn transaction_schema(&self, tx: TransactionId) -> StoreResult<Schema> {
        Ok(self.state.lock().transaction(tx)?.working.schema.clone())
    }

    /// Delete a database once no connection to it remains open.
    pub async fn delete_database(&self, name: &str) -> StoreResult<()> {
        let existed = self
            .wait_until(|state| match state.databases.get(name) {
                None => Some(Ok(false)),
                Some(db) if db.connections.is_empty() && db.is_idle() => {
                    state.databases.remove(name);
                    Some(Ok(true))
                }
                Some(_) => None,
            })
            .await?;
        if existed {
            info!(database = name, "database deleted");
            let hook = self.after_delete.read().clone();
            if let Some(hook) = hook {
                hook(name);
            }
        }
        Ok(())
    }

    // -- Transactions --------------------------------------------------------

    /// Begin a read-only or read-write transaction over `scope`.
    ///
    /// Read-write transactions wait for the database's writer slot. Fails with
    /// `InvalidStateError` while the connection runs a version change.
    pub async fn begin_transaction(
        &self,
        conn: ConnectionId,
        scope: &[String],
        mode: TransactionMode,
    ) -> StoreResult<TransactionId> {
        if mode == TransactionMode::VersionChange {
            return Err(StoreError::InvalidAccess(
                "version-change transactions are started with enter_version_change".into(),
            ));
        }
        if scope.is_empty() {
            return Err(StoreError::InvalidAccess("transaction scope is empty".into()));
        }

        let tx = self
            .wait_until(|state| {
                let database = match state.connection(conn) {
                    Ok(c) if c.version_change.is_some() => {
                        return Some(Err(StoreError::invalid_state(
                            "a version-change transaction is active on this connection",
                        )))
                    }
                    Ok(c) => c.database.clone(),
                    Err(e) => return Some(Err(e)),
                };
                let db = match state.databases.get_mut(&database) {
                    Some(db) => db,
                    None => return Some(Err(StoreError::not_found(format!("database '{}'", database)))),
                };
                if db.version_change || (mode.is_write() && db.writer.is_some()) {
                    return None;
                }
                if let Some(missing) = scope
                    .iter()
                    .find(|s| !db.committed.schema.object_stores.contains_key(s.as_str()))
                {
                    return Some(Err(StoreError::not_found(format!("object store '{}'", missing))));
                }

                let working = db.committed.clone();
                let id = TransactionId(state.next_id());
                if let Some(db) = state.databases.get_mut(&database) {
                    if mode.is_write() {
                        db.writer = Some(id);
                    } else {
                        db.readers += 1;
                    }
                }
                state.transactions.insert(
                    id,
                    TransactionState {
                        connection: conn,
                        database,
                        mode,
                        scope: scope.iter().cloned().collect(),
                        working,
                    },
                );
                Some(Ok(id))
            })
            .await?;
        trace!(transaction = %tx, ?mode, ?scope, "transaction started");
        Ok(tx)
    }

    /// Begin the exclusive version-change transaction that upgrades the
    /// connection's database to `new_version`.
    pub async fn enter_version_change(
        &self,
        conn: ConnectionId,
        new_version: u64,
    ) -> StoreResult<TransactionId> {
        let tx = self
            .wait_until(|state| {
                let database = match state.connection(conn) {
                    Ok(c) => c.database.clone(),
                    Err(e) => return Some(Err(e)),
                };
                let db = match state.databases.get_mut(&database) {
                    Some(db) => db,
                    None => return Some(Err(StoreError::not_found(format!("database '{}'", database)))),
                };
                let stored = db.committed.schema.database_version;
                if new_version <= stored {
                    return Some(Err(StoreError::Version {
                        requested: new_version,
                        stored,
                    }));
                }
                if !db.is_idle() {
                    return None;
                }

                let mut working = db.committed.clone();
                working.schema.database_version = new_version;
                let scope = working.schema.object_stores.keys().cloned().collect();
                let id = TransactionId(state.next_id());
                if let Some(db) = state.databases.get_mut(&database) {
                    db.writer = Some(id);
                    db.version_change = true;
                }
                if let Some(c) = state.connections.get_mut(&conn) {
                    c.version_change = Some(id);
                }
                state.transactions.insert(
                    id,
                    TransactionState {
                        connection: conn,
                        database,
                        mode: TransactionMode::VersionChange,
                        scope,
                        working,
                    },
                );
                Some(Ok(id))
            })
            .await?;
        info!(transaction = %tx, new_version, "version change started");
        Ok(tx)
    }

    /// Publish the transaction's working snapshot as the committed state.
    pub fn commit(&self, tx: TransactionId) -> StoreResult<()> {
        let (database, mode) = {
            let mut state = self.state.lock();
            let t = state
                .transactions
                .remove(&tx)
                .ok_or_else(|| StoreError::TransactionInactive(format!("{} is finished", tx)))?;
            state.release(tx, &t);
            if t.mode.is_write() {
                if let Some(db) = state.databases.get_mut(&t.database) {
                    db.committed = t.working;
                }
            }
            (t.database, t.mode)
        };
        self.changed.notify_waiters();
        debug!(transaction = %tx, ?mode, database = %database, "transaction committed");

        if mode.is_write() {
            let hook = self.after_commit.read().clone();
            if let Some(hook) = hook {
                hook(&database);
            }
        }
        Ok(())
    }

    /// Discard the transaction's working snapshot.
    pub fn rollback(&self, tx: TransactionId) -> StoreResult<()> {
        {
            let mut state = self.state.lock();
            let t = state
                .transactions
                .remove(&tx)
                .ok_or_else(|| StoreError::TransactionInactive(format!("{} is finished", tx)))?;
            state.release(tx, &t);
        }
        self.changed.notify_waiters();
        debug!(transaction = %tx, "transaction rolled back");
        Ok(())
    }

    // -- Schema changes (version-change only) --------------------------------

    pub fn create_object_store(
        &self,
        tx: TransactionId,
        name: &str,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let t = state.version_change_mut(tx)?;
        t.working
            .schema
            .add_object_store(name, key_path, auto_increment)?;
        t.working.stores.insert(name.to_string(), StoreData::new());
        t.scope.insert(name.to_string());
        debug!(transaction = %tx, store = name, "object store created");
        Ok(())
    }

    pub fn delete_object_store(&self, tx: TransactionId, name: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let t = state.version_change_mut(tx)?;
        let removed = t.working.schema.delete_object_store(name)?;
        t.working.stores.remove(name);
        for index in removed {
            t.working.indexes.remove(&index);
        }
        t.scope.remove(name);
        debug!(transaction = %tx, store = name, "object store deleted");
        Ok(())
    }

    pub fn rename_object_store(&self, tx: TransactionId, old: &str, new: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let t = state.version_change_mut(tx)?;
        t.working.schema.rename_object_store(old, new)?;
        if let Some(data) = t.working.stores.remove(old) {
            t.working.stores.insert(new.to_string(), data);
        }
        t.scope.remove(old);
        t.scope.insert(new.to_string());
        Ok(())
    }

    /// Create an index and back-fill it from the store's existing records.
    /// A unique index over duplicate values fails with `ConstraintError` and
    /// leaves the schema untouched.
    pub fn create_index(
        &self,
        tx: TransactionId,
        store: &str,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let t = state.version_change_mut(tx)?;
        let mut schema = t.working.schema.clone();
        schema.add_index(store, name, key_path.clone(), unique, multi_entry)?;
        let data = t.working.build_index(store, &key_path, unique, multi_entry)?;
        t.working.schema = schema;
        t.working.indexes.insert(name.to_string(), data);
        debug!(transaction = %tx, store, index = name, unique, multi_entry, "index created");
        Ok(())
    }

    pub fn delete_index(&self, tx: TransactionId, store: &str, name: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let t = state.version_change_mut(tx)?;
        t.working.schema.delete_index(store, name)?;
        t.working.indexes.remove(name);
        Ok(())
    }

    pub fn rename_index(&self, tx: TransactionId, store: &str, old: &str, new: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let t = state.version_change_mut(tx)?;
        t.working.schema.rename_index(store, old, new)?;
        if let Some(data) = t.working.indexes.remove(old) {
            t.working.indexes.insert(new.to_string(), data);
        }
        Ok(())
    }

    // -- Records -------------------------------------------------------------

    /// Insert or update one record; returns the effective primary key.
    pub fn store_record(&self, tx: TransactionId, request: RecordStoreRequest) -> StoreResult<Key> {
        let mut state = self.state.lock();
        let t = state.transaction_mut(tx)?;
        check_scope(t, &request.object_store)?;
        if !t.mode.is_write() {
            return Err(StoreError::ReadOnly(format!(
                "cannot write to '{}' in a read-only transaction",
                request.object_store
            )));
        }
        let key = t.working.store_record(request)?;
        trace!(transaction = %tx, ?key, "record stored");
        Ok(key)
    }

    /// Remove every record of `store` whose key falls in `range`. Returns
    /// the number of removed records.
    pub fn delete_record(&self, tx: TransactionId, store: &str, range: &KeyRange) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let t = state.transaction_mut(tx)?;
        check_scope(t, store)?;
        if !t.mode.is_write() {
            return Err(StoreError::ReadOnly(format!(
                "cannot delete from '{}' in a read-only transaction",
                store
            )));
        }
        let removed = t.working.delete_records(store, range)?;
        trace!(transaction = %tx, store, removed, "records deleted");
        Ok(removed)
    }

    /// Point lookups, range scans, counts and cursor steps.
    pub fn get_records(&self, tx: TransactionId, request: &RecordGetRequest) -> StoreResult<RecordGetResponse> {
        let state = self.state.lock();
        let t = state.transaction(tx)?;
        check_scope(t, &request.object_store)?;
        t.working.get_records(request)
    }
}

fn check_scope(t: &TransactionState, store: &str) -> StoreResult<()> {
    if t.scope.contains(store) {
        Ok(())
    } else {
        Err(StoreError::not_found(format!(
            "object store '{}' is not in the transaction scope",
            store
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helpers -------------------------------------------------------------

    async fn books_backend() -> (MemoryBackend, ConnectionId) {
        let backend = MemoryBackend::new();
        let conn = backend.connect_database("library").await.unwrap();
        let vc = backend.enter_version_change(conn, 1).await.unwrap();
        backend
            .create_object_store(vc, "books", Some("isbn".into()), false)
            .unwrap();
        backend
            .create_index(vc, "books", "by_title", "title".into(), true, false)
            .unwrap();
        backend.commit(vc).unwrap();
        (backend, conn)
    }

    fn book(isbn: i64, title: &str) -> Value {
        Value::object().with_field("isbn", isbn).with_field("title", title)
    }

    fn put(isbn: i64, title: &str) -> RecordStoreRequest {
        RecordStoreRequest {
            object_store: "books".into(),
            value: book(isbn, title),
            key: None,
            level: StoreLevel::NoOverwrite,
        }
    }

    fn scope() -> Vec<String> {
        vec!["books".to_string()]
    }

    fn count(backend: &MemoryBackend, tx: TransactionId) -> usize {
        backend
            .get_records(
                tx,
                &RecordGetRequest {
                    result_level: ResultLevel::OnlyCount,
                    ..RecordGetRequest::new("books")
                },
            )
            .unwrap()
            .count
    }

    // -- Lifecycle -----------------------------------------------------------

    #[tokio::test]
    async fn version_change_publishes_schema_on_commit() {
        let (backend, conn) = books_backend().await;
        let schema = backend.schema(conn).unwrap();
        assert_eq!(schema.database_version, 1);
        assert!(schema.object_stores.contains_key("books"));
        assert_eq!(backend.database_names(), vec![("library".to_string(), 1)]);
    }

    #[tokio::test]
    async fn aborted_version_change_leaves_schema_untouched() {
        let backend = MemoryBackend::new();
        let conn = backend.connect_database("db").await.unwrap();
        let vc = backend.enter_version_change(conn, 1).await.unwrap();
        backend.create_object_store(vc, "s", None, true).unwrap();
        backend.rollback(vc).unwrap();
        let schema = backend.schema(conn).unwrap();
        assert_eq!(schema.database_version, 0);
        assert!(schema.object_stores.is_empty());
    }

    #[tokio::test]
    async fn version_must_increase() {
        let (backend, conn) = books_backend().await;
        let err = backend.enter_version_change(conn, 1).await.unwrap_err();
        assert_eq!(err.name(), "VersionError");
    }

    #[tokio::test]
    async fn schema_ops_outside_version_change_fail() {
        let (backend, conn) = books_backend().await;
        let tx = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadWrite)
            .await
            .unwrap();
        let err = backend.create_object_store(tx, "x", None, false).unwrap_err();
        assert_eq!(err.name(), "InvalidStateError");
    }

    #[tokio::test]
    async fn readers_see_snapshot_from_begin() {
        let (backend, conn) = books_backend().await;
        let writer = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadWrite)
            .await
            .unwrap();
        backend.store_record(writer, put(1, "Dune")).unwrap();

        let reader = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(count(&backend, reader), 0);
        backend.commit(writer).unwrap();
        assert_eq!(count(&backend, reader), 0);
        backend.commit(reader).unwrap();

        let later = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(count(&backend, later), 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let (backend, conn) = books_backend().await;
        let tx = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadWrite)
            .await
            .unwrap();
        backend.store_record(tx, put(1, "Dune")).unwrap();
        backend.rollback(tx).unwrap();

        let tx = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(count(&backend, tx), 0);
    }

    #[tokio::test]
    async fn second_writer_waits_for_first() {
        let (backend, conn) = books_backend().await;
        let backend = Arc::new(backend);
        let first = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadWrite)
            .await
            .unwrap();

        let b = Arc::clone(&backend);
        let waiter = tokio::spawn(async move {
            b.begin_transaction(conn, &["books".to_string()], TransactionMode::ReadWrite)
                .await
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        backend.commit(first).unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let (backend, conn) = books_backend().await;
        let tx = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadOnly)
            .await
            .unwrap();
        let err = backend.store_record(tx, put(1, "Dune")).unwrap_err();
        assert_eq!(err.name(), "ReadOnlyError");
        let err = backend.delete_record(tx, "books", &KeyRange::all()).unwrap_err();
        assert_eq!(err.name(), "ReadOnlyError");
    }

    #[tokio::test]
    async fn unknown_scope_is_not_found() {
        let (backend, conn) = books_backend().await;
        let err = backend
            .begin_transaction(conn, &["nope".to_string()], TransactionMode::ReadOnly)
            .await
            .unwrap_err();
        assert_eq!(err.name(), "NotFoundError");
    }

    #[tokio::test]
    async fn commit_hook_fires_for_writes_only() {
        let (backend, conn) = books_backend().await;
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        backend.set_after_commit(Arc::new(move |db: &str| sink.lock().push(db.to_string())));

        let ro = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadOnly)
            .await
            .unwrap();
        backend.commit(ro).unwrap();
        assert!(fired.lock().is_empty());

        let rw = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadWrite)
            .await
            .unwrap();
        backend.commit(rw).unwrap();
        assert_eq!(*fired.lock(), vec!["library".to_string()]);
    }

    #[tokio::test]
    async fn delete_hook_fires_only_for_existing_databases() {
        let (backend, conn) = books_backend().await;
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        backend.set_after_delete(Arc::new(move |db: &str| sink.lock().push(db.to_string())));

        backend.delete_database("missing").await.unwrap();
        assert!(fired.lock().is_empty());

        backend.close_connection(conn);
        backend.delete_database("library").await.unwrap();
        assert_eq!(*fired.lock(), vec!["library".to_string()]);
        assert!(backend.database_names().is_empty());
    }

    #[tokio::test]
    async fn create_unique_index_over_duplicates_fails() {
        let (backend, conn) = books_backend().await;
        let tx = backend
            .begin_transaction(conn, &scope(), TransactionMode::ReadWrite)
            .await
            .unwrap();
        backend.store_record(tx, put(1, "Dune")).unwrap();
        backend
            .store_record(
                tx,
                RecordStoreRequest {
                    value: book(2, "Emma").with_field("author", "X"),
                    ..put(2, "Emma")
                },
            )
            .unwrap();
        backend
            .store_record(
                tx,
                RecordStoreRequest {
                    value: book(3, "Ulysses").with_field("author", "X"),
                    ..put(3, "Ulysses")
                },
            )
            .unwrap();
        backend.commit(tx).unwrap();

        let vc = backend.enter_version_change(conn, 2).await.unwrap();
        let err = backend
            .create_index(vc, "books", "by_author", "author".into(), true, false)
            .unwrap_err();
        assert_eq!(err.name(), "ConstraintError");
        assert!(backend.transaction_schema(vc).unwrap().indexes.get("by_author").is_none());

        backend
            .create_index(vc, "books", "by_author", "author".into(), false, false)
            .unwrap();
        backend.commit(vc).unwrap();
        assert!(backend.schema(conn).unwrap().indexes.contains_key("by_author"));
    }

    #[tokio::test]
    async fn delete_database_waits_for_connections() {
        let (backend, conn) = books_backend().await;
        let backend = Arc::new(backend);
        let b = Arc::clone(&backend);
        let deleter = tokio::spawn(async move { b.delete_database("library").await });
        tokio::task::yield_now().await;
        assert!(!deleter.is_finished());

        backend.close_connection(conn);
        deleter.await.unwrap().unwrap();
        assert!(backend.database_names().is_empty());
    }
}
