//! # Factory, Database and Version Change
//!
//! [`Factory::open`] negotiates the version of a named database:
//!
//! | stored vs. requested | result |
//! |----------------------|--------|
//! | stored > requested   | `VersionError` |
//! | stored = requested   | opened as is |
//! | stored < requested   | upgrade callback runs in a version-change transaction, then opened |
//!
//! Each open [`Database`] owns one backend connection and one scheduler task.
//! The task runs the connection's transactions strictly one after another;
//! a transaction created while another is running waits in the queue. When
//! the last `Database` handle is dropped (or [`Database::close`] is called)
//! the task finishes the queued transactions and closes the connection.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backend::{ConnectionId, MemoryBackend, TransactionMode};
use crate::error::{StoreError, StoreResult};
use crate::key_path::KeyPath;
use crate::object_store::{ObjectStore, ObjectStoreOptions};
use crate::schema::Schema;
use crate::transaction::{Transaction, TransactionJob};

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Entry point: opens, lists and deletes databases of one backend.
#[derive(Debug, Clone, Default)]
pub struct Factory {
    backend: Arc<MemoryBackend>,
}

impl Factory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    /// Open `name` at `version`, running `upgrade` when the stored version is
    /// lower. An upgrade error, or any failure inside the version-change
    /// transaction, rolls the upgrade back and fails the open.
    pub async fn open<F, Fut>(&self, name: &str, version: u64, upgrade: F) -> StoreResult<Database>
    where
        F: FnOnce(VersionChange) -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        if version == 0 {
            return Err(StoreError::data("database version must be at least 1"));
        }
        let conn = self.backend.connect_database(name).await?;
        let stored = match self.backend.schema(conn) {
            Ok(schema) => schema.database_version,
            Err(e) => {
                self.backend.close_connection(conn);
                return Err(e);
            }
        };
        if version < stored {
            self.backend.close_connection(conn);
            return Err(StoreError::Version {
                requested: version,
                stored,
            });
        }

        let db = Database::start(Arc::clone(&self.backend), conn, name);
        if version > stored {
            if let Err(e) = db.upgrade(stored, version, upgrade).await {
                db.close();
                return Err(e);
            }
            info!(database = name, old_version = stored, new_version = version, "database upgraded");
        }
        debug!(database = name, version, connection = %conn, "database opened");
        Ok(db)
    }

    /// Names and versions of every database.
    pub fn database_names(&self) -> Vec<(String, u64)> {
        self.backend.database_names()
    }

    /// Delete a database once every connection to it has closed.
    pub async fn delete_database(&self, name: &str) -> StoreResult<()> {
        self.backend.delete_database(name).await
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

struct DbShared {
    backend: Arc<MemoryBackend>,
    conn: ConnectionId,
    name: String,
    jobs: Mutex<Option<mpsc::UnboundedSender<TransactionJob>>>,
}

/// An open connection. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DbShared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.shared.name)
            .field("connection", &self.shared.conn)
            .finish()
    }
}

async fn run_scheduler(
    backend: Arc<MemoryBackend>,
    conn: ConnectionId,
    mut jobs: mpsc::UnboundedReceiver<TransactionJob>,
) {
    while let Some(job) = jobs.recv().await {
        job.run(conn).await;
    }
    backend.close_connection(conn);
}

impl Database {
    fn start(backend: Arc<MemoryBackend>, conn: ConnectionId, name: &str) -> Self {
        let (jobs, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_scheduler(Arc::clone(&backend), conn, queue));
        Self {
            shared: Arc::new(DbShared {
                backend,
                conn,
                name: name.to_string(),
                jobs: Mutex::new(Some(jobs)),
            }),
        }
    }

    fn enqueue(&self, job: TransactionJob) -> StoreResult<()> {
        let jobs = self.shared.jobs.lock();
        match jobs.as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| StoreError::invalid_state("database connection is closed")),
            None => Err(StoreError::invalid_state("database connection is closed")),
        }
    }

    async fn upgrade<F, Fut>(&self, old_version: u64, new_version: u64, upgrade: F) -> StoreResult<()>
    where
        F: FnOnce(VersionChange) -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        let backend = &self.shared.backend;
        let id = backend.enter_version_change(self.shared.conn, new_version).await?;
        let schema = backend.transaction_schema(id)?;
        let (tx, job) = Transaction::new(
            Arc::clone(backend),
            schema,
            Vec::new(),
            TransactionMode::VersionChange,
            Some(id),
        );
        if let Err(e) = self.enqueue(job) {
            let _ = backend.rollback(id);
            return Err(e);
        }

        let completion = tx.subscribe();
        let control = tx.clone();
        let result = upgrade(VersionChange {
            tx,
            old_version,
            new_version,
        })
        .await;
        // Either may fail when the transaction already aborted itself; the
        // completion below reports why.
        let _ = match result {
            Ok(()) => control.commit(),
            Err(_) => control.abort(),
        };
        drop(control);
        let outcome = completion.wait().await;
        result.and(outcome)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Committed version.
    pub fn version(&self) -> StoreResult<u64> {
        Ok(self.schema()?.database_version)
    }

    /// Committed schema.
    pub fn schema(&self) -> StoreResult<Schema> {
        self.shared.backend.schema(self.shared.conn)
    }

    pub fn object_store_names(&self) -> StoreResult<Vec<String>> {
        Ok(self.schema()?.object_stores.keys().cloned().collect())
    }

    /// Queue a read-only or read-write transaction over `scope`.
    pub fn transaction(&self, scope: &[&str], mode: TransactionMode) -> StoreResult<Transaction> {
        if mode == TransactionMode::VersionChange {
            return Err(StoreError::InvalidAccess(
                "version-change transactions only run inside Factory::open".into(),
            ));
        }
        if scope.is_empty() {
            return Err(StoreError::InvalidAccess("transaction scope is empty".into()));
        }
        let schema = self.schema()?;
        for name in scope {
            schema.object_store(name)?;
        }
        let scope: Vec<String> = scope.iter().map(|s| s.to_string()).collect();
        let (tx, job) = Transaction::new(Arc::clone(&self.shared.backend), schema, scope, mode, None);
        self.enqueue(job)?;
        Ok(tx)
    }

    /// Run `body` in a read-only transaction.
    pub async fn run_read<T, E, F, Fut>(&self, scope: &[&str], body: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(scope, TransactionMode::ReadOnly, body).await
    }

    /// Run `body` in a read-write transaction: commit on `Ok`, abort on `Err`.
    /// Resolves only after the transaction finished. The body may use any
    /// error type that store errors convert into.
    pub async fn run_write<T, E, F, Fut>(&self, scope: &[&str], body: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(scope, TransactionMode::ReadWrite, body).await
    }

    async fn run<T, E, F, Fut>(&self, scope: &[&str], mode: TransactionMode, body: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let tx = self.transaction(scope, mode)?;
        let completion = tx.subscribe();
        let control = tx.clone();
        match body(tx).await {
            Ok(value) => {
                let _ = control.commit();
                drop(control);
                completion.wait().await?;
                Ok(value)
            }
            Err(e) => {
                let _ = control.abort();
                drop(control);
                let _ = completion.wait().await;
                Err(e)
            }
        }
    }

    /// Stop accepting transactions. Queued ones still run; the connection
    /// closes after the last of them.
    pub fn close(&self) {
        self.shared.jobs.lock().take();
    }
}

// ---------------------------------------------------------------------------
// VersionChange
// ---------------------------------------------------------------------------

/// Handed to the upgrade callback of [`Factory::open`]. Schema changes apply
/// to the running version-change transaction and become visible to others
/// only when it commits.
#[derive(Debug, Clone)]
pub struct VersionChange {
    tx: Transaction,
    old_version: u64,
    new_version: u64,
}

impl VersionChange {
    pub fn old_version(&self) -> u64 {
        self.old_version
    }

    pub fn new_version(&self) -> u64 {
        self.new_version
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn object_store(&self, name: &str) -> StoreResult<ObjectStore> {
        self.tx.object_store(name)
    }

    fn id(&self) -> StoreResult<crate::backend::TransactionId> {
        if self.tx.is_finishing() {
            return Err(StoreError::TransactionInactive("version change has finished".into()));
        }
        self.tx
            .id()
            .ok_or_else(|| StoreError::invalid_state("version change has not started"))
    }

    pub fn create_object_store(&self, name: &str, options: ObjectStoreOptions) -> StoreResult<ObjectStore> {
        self.tx.backend().create_object_store(
            self.id()?,
            name,
            options.key_path,
            options.auto_increment,
        )?;
        self.tx.object_store(name)
    }

    pub fn delete_object_store(&self, name: &str) -> StoreResult<()> {
        self.tx.backend().delete_object_store(self.id()?, name)
    }

    pub fn rename_object_store(&self, old: &str, new: &str) -> StoreResult<()> {
        self.tx.backend().rename_object_store(self.id()?, old, new)
    }

    pub fn rename_index(&self, store: &str, old: &str, new: &str) -> StoreResult<()> {
        self.tx.backend().rename_index(self.id()?, store, old, new)
    }

    /// Shorthand for `create_object_store` with an in-line key path.
    pub fn create_keyed_store(&self, name: &str, key_path: impl Into<KeyPath>) -> StoreResult<ObjectStore> {
        self.create_object_store(name, ObjectStoreOptions::new().key_path(key_path))
    }
}
