//! Object store and index handles.
//!
//! Handles are thin: a [`Transaction`] clone plus names. Each data operation
//! is enqueued on the transaction and answered through a [`Request`].
//! Argument problems detectable at call time (read-only transaction, finished
//! transaction) come back as an already-failed request and never abort the
//! transaction.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{
    CursorDirection, RecordGetRequest, RecordGetResponse, RecordStoreRequest, ResultLevel,
    StoreLevel, TransactionId, TransactionMode,
};
use crate::cursor::Cursor;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::key_path::KeyPath;
use crate::range::KeyRange;
use crate::schema::{IndexProperties, ObjectStoreProperties};
use crate::transaction::{ErrorPolicy, Request, Transaction};
use crate::value::Value;

/// Options for [`VersionChange::create_object_store`](crate::VersionChange::create_object_store).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreOptions {
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
}

impl ObjectStoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }
}

/// Options for [`ObjectStore::create_index`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexOptions {
    pub fn unique() -> Self {
        Self {
            unique: true,
            multi_entry: false,
        }
    }

    pub fn multi_entry() -> Self {
        Self {
            unique: false,
            multi_entry: true,
        }
    }
}

fn first<T>(items: Vec<T>) -> Option<T> {
    items.into_iter().next()
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ObjectStore {
    tx: Transaction,
    name: String,
    policy: ErrorPolicy,
}

impl ObjectStore {
    pub(crate) fn new(tx: Transaction, name: String) -> Self {
        Self {
            tx,
            name,
            policy: ErrorPolicy::default(),
        }
    }

    /// Failed requests on this handle leave the transaction running.
    pub fn recover_errors(mut self) -> Self {
        self.policy = ErrorPolicy::Recover;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn properties(&self) -> StoreResult<ObjectStoreProperties> {
        Ok(self.tx.schema()?.object_store(&self.name)?.clone())
    }

    pub fn key_path(&self) -> StoreResult<Option<KeyPath>> {
        Ok(self.properties()?.key_path)
    }

    pub fn auto_increment(&self) -> StoreResult<bool> {
        Ok(self.properties()?.auto_increment)
    }

    pub fn index_names(&self) -> StoreResult<Vec<String>> {
        Ok(self.properties()?.index_names)
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.tx.mode() == TransactionMode::ReadOnly {
            return Err(StoreError::ReadOnly(format!(
                "object store '{}' is in a read-only transaction",
                self.name
            )));
        }
        if self.tx.is_finishing() {
            return Err(StoreError::TransactionInactive("transaction has finished".into()));
        }
        Ok(())
    }

    // -- Writes --------------------------------------------------------------

    /// Insert or replace. Returns the effective key.
    pub fn put(&self, value: impl Into<Value>, key: Option<Key>) -> Request<Key> {
        self.store(value.into(), key, StoreLevel::AllowOverwrite)
    }

    /// Insert; an existing record under the key is a `ConstraintError`.
    pub fn add(&self, value: impl Into<Value>, key: Option<Key>) -> Request<Key> {
        self.store(value.into(), key, StoreLevel::NoOverwrite)
    }

    /// `put` for any serializable record (in-line keys).
    pub fn put_item<T: Serialize>(&self, item: &T) -> Request<Key> {
        match Value::from_serialize(item) {
            Ok(value) => self.put(value, None),
            Err(e) => Request::failed(e),
        }
    }

    /// `add` for any serializable record (in-line keys).
    pub fn add_item<T: Serialize>(&self, item: &T) -> Request<Key> {
        match Value::from_serialize(item) {
            Ok(value) => self.add(value, None),
            Err(e) => Request::failed(e),
        }
    }

    fn store(&self, value: Value, key: Option<Key>, level: StoreLevel) -> Request<Key> {
        if let Err(e) = self.check_writable() {
            return Request::failed(e);
        }
        let request = RecordStoreRequest {
            object_store: self.name.clone(),
            value,
            key,
            level,
        };
        self.tx
            .schedule(self.policy, move |backend, id| backend.store_record(id, request))
    }

    /// Delete every record in `range`.
    pub fn delete(&self, range: impl Into<KeyRange>) -> Request<()> {
        if let Err(e) = self.check_writable() {
            return Request::failed(e);
        }
        let store = self.name.clone();
        let range = range.into();
        self.tx.schedule(self.policy, move |backend, id| {
            backend.delete_record(id, &store, &range).map(|_| ())
        })
    }

    pub fn clear(&self) -> Request<()> {
        self.delete(KeyRange::all())
    }

    // -- Reads ---------------------------------------------------------------

    fn query<T, F>(&self, range: KeyRange, limit: usize, result_level: ResultLevel, map: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(RecordGetResponse) -> StoreResult<T> + Send + 'static,
    {
        let request = RecordGetRequest {
            range,
            limit,
            result_level,
            ..RecordGetRequest::new(self.name.clone())
        };
        self.tx.schedule(self.policy, move |backend, id| {
            map(backend.get_records(id, &request)?)
        })
    }

    /// First record in `range`.
    pub fn get(&self, range: impl Into<KeyRange>) -> Request<Option<Value>> {
        self.query(range.into(), 1, ResultLevel::Full, |r| Ok(first(r.values)))
    }

    /// First record in `range`, deserialized.
    pub fn get_item<T>(&self, range: impl Into<KeyRange>) -> Request<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.query(range.into(), 1, ResultLevel::Full, |r| {
            first(r.values).map(|v| v.deserialize_into()).transpose()
        })
    }

    /// Key of the first record in `range`.
    pub fn get_key(&self, range: impl Into<KeyRange>) -> Request<Option<Key>> {
        self.query(range.into(), 1, ResultLevel::OnlyKeys, |r| Ok(first(r.primary_keys)))
    }

    /// Up to `count` records in key order (`0` = all).
    pub fn get_all(&self, range: impl Into<KeyRange>, count: usize) -> Request<Vec<Value>> {
        self.query(range.into(), count, ResultLevel::Full, |r| Ok(r.values))
    }

    pub fn get_all_items<T>(&self, range: impl Into<KeyRange>, count: usize) -> Request<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.query(range.into(), count, ResultLevel::Full, |r| {
            r.values.iter().map(Value::deserialize_into).collect()
        })
    }

    pub fn get_all_keys(&self, range: impl Into<KeyRange>, count: usize) -> Request<Vec<Key>> {
        self.query(range.into(), count, ResultLevel::OnlyKeys, |r| Ok(r.primary_keys))
    }

    pub fn count(&self, range: impl Into<KeyRange>) -> Request<usize> {
        self.query(range.into(), 0, ResultLevel::OnlyCount, |r| Ok(r.count))
    }

    pub fn open_cursor(&self, range: impl Into<KeyRange>, direction: CursorDirection) -> Request<Option<Cursor>> {
        Cursor::open(self.tx.clone(), self.name.clone(), None, range.into(), direction, false, self.policy)
    }

    pub fn open_key_cursor(&self, range: impl Into<KeyRange>, direction: CursorDirection) -> Request<Option<Cursor>> {
        Cursor::open(self.tx.clone(), self.name.clone(), None, range.into(), direction, true, self.policy)
    }

    // -- Indexes -------------------------------------------------------------

    pub fn index(&self, name: &str) -> StoreResult<Index> {
        self.tx.schema()?.store_index(&self.name, name)?;
        Ok(Index {
            tx: self.tx.clone(),
            store: self.name.clone(),
            name: name.to_string(),
            policy: self.policy,
        })
    }

    /// Create an index. Only inside a version-change transaction.
    pub fn create_index(&self, name: &str, key_path: impl Into<KeyPath>, options: IndexOptions) -> StoreResult<Index> {
        let id = self.version_change_id()?;
        self.tx.backend().create_index(
            id,
            &self.name,
            name,
            key_path.into(),
            options.unique,
            options.multi_entry,
        )?;
        self.index(name)
    }

    /// Delete an index. Only inside a version-change transaction.
    pub fn delete_index(&self, name: &str) -> StoreResult<()> {
        let id = self.version_change_id()?;
        self.tx.backend().delete_index(id, &self.name, name)
    }

    fn version_change_id(&self) -> StoreResult<TransactionId> {
        if self.tx.mode() != TransactionMode::VersionChange {
            return Err(StoreError::invalid_state(
                "indexes can only be changed in a version-change transaction",
            ));
        }
        if self.tx.is_finishing() {
            return Err(StoreError::TransactionInactive("transaction has finished".into()));
        }
        self.tx
            .id()
            .ok_or_else(|| StoreError::invalid_state("version change has not started"))
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Index {
    tx: Transaction,
    store: String,
    name: String,
    policy: ErrorPolicy,
}

impl Index {
    pub fn recover_errors(mut self) -> Self {
        self.policy = ErrorPolicy::Recover;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_store_name(&self) -> &str {
        &self.store
    }

    pub fn properties(&self) -> StoreResult<IndexProperties> {
        Ok(self.tx.schema()?.store_index(&self.store, &self.name)?.clone())
    }

    fn query<T, F>(&self, range: KeyRange, limit: usize, result_level: ResultLevel, map: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(RecordGetResponse) -> StoreResult<T> + Send + 'static,
    {
        let request = RecordGetRequest {
            index: Some(self.name.clone()),
            range,
            limit,
            result_level,
            ..RecordGetRequest::new(self.store.clone())
        };
        self.tx.schedule(self.policy, move |backend, id| {
            map(backend.get_records(id, &request)?)
        })
    }

    /// Record with the lowest `(index key, primary key)` in `range`.
    pub fn get(&self, range: impl Into<KeyRange>) -> Request<Option<Value>> {
        self.query(range.into(), 1, ResultLevel::Full, |r| Ok(first(r.values)))
    }

    pub fn get_item<T>(&self, range: impl Into<KeyRange>) -> Request<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.query(range.into(), 1, ResultLevel::Full, |r| {
            first(r.values).map(|v| v.deserialize_into()).transpose()
        })
    }

    /// Primary key of the first record in `range`.
    pub fn get_key(&self, range: impl Into<KeyRange>) -> Request<Option<Key>> {
        self.query(range.into(), 1, ResultLevel::OnlyKeys, |r| Ok(first(r.primary_keys)))
    }

    pub fn get_all(&self, range: impl Into<KeyRange>, count: usize) -> Request<Vec<Value>> {
        self.query(range.into(), count, ResultLevel::Full, |r| Ok(r.values))
    }

    pub fn get_all_items<T>(&self, range: impl Into<KeyRange>, count: usize) -> Request<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.query(range.into(), count, ResultLevel::Full, |r| {
            r.values.iter().map(Value::deserialize_into).collect()
        })
    }

    /// Primary keys in index order.
    pub fn get_all_keys(&self, range: impl Into<KeyRange>, count: usize) -> Request<Vec<Key>> {
        self.query(range.into(), count, ResultLevel::OnlyKeys, |r| Ok(r.primary_keys))
    }

    pub fn count(&self, range: impl Into<KeyRange>) -> Request<usize> {
        self.query(range.into(), 0, ResultLevel::OnlyCount, |r| Ok(r.count))
    }

    pub fn open_cursor(&self, range: impl Into<KeyRange>, direction: CursorDirection) -> Request<Option<Cursor>> {
        Cursor::open(
            self.tx.clone(),
            self.store.clone(),
            Some(self.name.clone()),
            range.into(),
            direction,
            false,
            self.policy,
        )
    }

    pub fn open_key_cursor(&self, range: impl Into<KeyRange>, direction: CursorDirection) -> Request<Option<Cursor>> {
        Cursor::open(
            self.tx.clone(),
            self.store.clone(),
            Some(self.name.clone()),
            range.into(),
            direction,
            true,
            self.policy,
        )
    }
}
