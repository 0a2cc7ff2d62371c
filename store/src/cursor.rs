//! # Cursors
//!
//! A cursor walks an object store or an index one step at a time. Each step
//! is a backend scan with `limit = 1` (or `limit = n` for [`Cursor::advance`])
//! that starts strictly after the cursor's last position and, for
//! `continue(key)` and `continue_primary_key`, at or after a target.
//!
//! | Source        | `key`      | `primary_key` |
//! |---------------|------------|---------------|
//! | object store  | record key | record key    |
//! | index         | index key  | record key    |
//!
//! Steps are enqueued like every other request, so a cursor's continuation
//! runs after whatever else the transaction already has queued. Only one
//! step may be in flight: until it lands the cursor has no value and
//! another step fails with `InvalidStateError`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    CursorDirection, RecordGetRequest, RecordGetResponse, RecordStoreRequest, ResultLevel,
    StoreLevel, TransactionMode,
};
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::key_path::extract_key;
use crate::range::KeyRange;
use crate::transaction::{ErrorPolicy, Request, Transaction};
use crate::value::Value;

#[derive(Debug, Default)]
struct Position {
    key: Option<Key>,
    primary_key: Option<Key>,
    value: Option<Value>,
    got_value: bool,
}

impl Position {
    /// Move to the last entry of `resp`, or past the end when it is empty.
    fn land(&mut self, resp: RecordGetResponse, from_index: bool) -> bool {
        let Some(primary) = resp.primary_keys.last().cloned() else {
            *self = Position::default();
            return false;
        };
        self.key = if from_index {
            resp.index_keys.last().cloned()
        } else {
            Some(primary.clone())
        };
        self.primary_key = Some(primary);
        self.value = resp.values.last().cloned();
        self.got_value = true;
        true
    }
}

pub struct Cursor {
    tx: Transaction,
    store: String,
    index: Option<String>,
    range: KeyRange,
    direction: CursorDirection,
    key_only: bool,
    policy: ErrorPolicy,
    position: Arc<Mutex<Position>>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("store", &self.store)
            .field("index", &self.index)
            .field("direction", &self.direction)
            .field("position", &*self.position.lock())
            .finish()
    }
}

impl Cursor {
    /// Enqueue the first step; resolves to `None` when nothing matches.
    pub(crate) fn open(
        tx: Transaction,
        store: String,
        index: Option<String>,
        range: KeyRange,
        direction: CursorDirection,
        key_only: bool,
        policy: ErrorPolicy,
    ) -> Request<Option<Cursor>> {
        let request = RecordGetRequest {
            index: index.clone(),
            range: range.clone(),
            direction,
            limit: 1,
            result_level: result_level(key_only),
            ..RecordGetRequest::new(store.clone())
        };
        let handle = tx.clone();
        tx.schedule(policy, move |backend, id| {
            let resp = backend.get_records(id, &request)?;
            let mut position = Position::default();
            if !position.land(resp, index.is_some()) {
                return Ok(None);
            }
            Ok(Some(Cursor {
                tx: handle,
                store,
                index,
                range,
                direction,
                key_only,
                policy,
                position: Arc::new(Mutex::new(position)),
            }))
        })
    }

    pub fn direction(&self) -> CursorDirection {
        self.direction
    }

    pub fn key(&self) -> Option<Key> {
        self.position.lock().key.clone()
    }

    pub fn primary_key(&self) -> Option<Key> {
        self.position.lock().primary_key.clone()
    }

    /// Current record; always `None` for key cursors.
    pub fn value(&self) -> Option<Value> {
        self.position.lock().value.clone()
    }

    pub fn value_as<T: serde::de::DeserializeOwned>(&self) -> StoreResult<Option<T>> {
        self.value().map(|v| v.deserialize_into()).transpose()
    }

    /// Step once in the cursor's direction, or to the first entry at or
    /// beyond `key`. Resolves to `false` once the cursor ran off the end.
    pub fn continue_(&self, key: Option<Key>) -> Request<bool> {
        if let Some(key) = &key {
            if let Err(e) = self.ensure_positioned().and_then(|_| self.check_forward(key, None)) {
                return Request::failed(e);
            }
        }
        let mut request = match self.next_step() {
            Ok(request) => request,
            Err(e) => return Request::failed(e),
        };
        if let Some(key) = key {
            if self.index.is_some() {
                request.advance_index_key = Some(key);
            } else {
                request.advance_primary_key = Some(key);
            }
        }
        self.step(request)
    }

    /// Index cursors only: step to the first entry at or beyond
    /// `(key, primary_key)`.
    pub fn continue_primary_key(&self, key: Key, primary_key: Key) -> Request<bool> {
        if self.index.is_none() || self.direction.is_unique() {
            return Request::failed(StoreError::InvalidAccess(
                "continue_primary_key needs an index cursor with a next or prev direction".into(),
            ));
        }
        if let Err(e) = self
            .ensure_positioned()
            .and_then(|_| self.check_forward(&key, Some(&primary_key)))
        {
            return Request::failed(e);
        }
        let mut request = match self.next_step() {
            Ok(request) => request,
            Err(e) => return Request::failed(e),
        };
        request.advance_index_key = Some(key);
        request.advance_primary_key = Some(primary_key);
        self.step(request)
    }

    /// Skip `count` entries; the cursor lands on the `count`-th.
    pub fn advance(&self, count: u32) -> Request<bool> {
        if count == 0 {
            return Request::failed(StoreError::data("advance count must be positive"));
        }
        let mut request = match self.next_step() {
            Ok(request) => request,
            Err(e) => return Request::failed(e),
        };
        request.limit = count as usize;
        let position = Arc::clone(&self.position);
        let from_index = self.index.is_some();
        let wanted = count as usize;
        self.tx.schedule(self.policy, move |backend, id| {
            let resp = backend.get_records(id, &request)?;
            let mut position = position.lock();
            if resp.count < wanted {
                *position = Position::default();
                return Ok(false);
            }
            Ok(position.land(resp, from_index))
        })
    }

    /// Replace the current record, keeping its key.
    pub fn update(&self, value: impl Into<Value>) -> Request<Key> {
        let value = value.into();
        let primary = match self.writable_position() {
            Ok(primary) => primary,
            Err(e) => return Request::failed(e),
        };
        match self.tx.schema().and_then(|s| Ok(s.object_store(&self.store)?.key_path.clone())) {
            Ok(Some(path)) => match extract_key(&value, &path) {
                Ok(k) if k == primary => {}
                Ok(_) => {
                    return Request::failed(StoreError::data(
                        "updated record's in-line key differs from the cursor's",
                    ))
                }
                Err(e) => return Request::failed(e),
            },
            Ok(None) => {}
            Err(e) => return Request::failed(e),
        }
        let request = RecordStoreRequest {
            object_store: self.store.clone(),
            value,
            key: Some(primary),
            level: StoreLevel::UpdateExisting,
        };
        self.tx
            .schedule(self.policy, move |backend, id| backend.store_record(id, request))
    }

    /// Delete the current record.
    pub fn delete(&self) -> Request<()> {
        let primary = match self.writable_position() {
            Ok(primary) => primary,
            Err(e) => return Request::failed(e),
        };
        let store = self.store.clone();
        self.tx.schedule(self.policy, move |backend, id| {
            backend
                .delete_record(id, &store, &KeyRange::only(primary))
                .map(|_| ())
        })
    }

    // -- Internals -----------------------------------------------------------

    fn ensure_positioned(&self) -> StoreResult<()> {
        if self.tx.is_finishing() {
            return Err(StoreError::TransactionInactive("transaction has finished".into()));
        }
        if !self.position.lock().got_value {
            return Err(StoreError::invalid_state(
                "cursor is moving or has run past the end",
            ));
        }
        Ok(())
    }

    /// Request resuming after the current position; clears `got_value`.
    fn next_step(&self) -> StoreResult<RecordGetRequest> {
        self.ensure_positioned()?;
        let mut position = self.position.lock();
        position.got_value = false;
        let (last_index, last_primary) = if self.index.is_some() {
            (position.key.clone(), position.primary_key.clone())
        } else {
            (None, position.primary_key.clone())
        };
        Ok(RecordGetRequest {
            index: self.index.clone(),
            range: self.range.clone(),
            direction: self.direction,
            last_index_position: last_index,
            last_object_store_position: last_primary,
            limit: 1,
            result_level: result_level(self.key_only),
            ..RecordGetRequest::new(self.store.clone())
        })
    }

    fn step(&self, request: RecordGetRequest) -> Request<bool> {
        let position = Arc::clone(&self.position);
        let from_index = self.index.is_some();
        self.tx.schedule(self.policy, move |backend, id| {
            let resp = backend.get_records(id, &request)?;
            Ok(position.lock().land(resp, from_index))
        })
    }

    /// A target must lie strictly ahead of the current position.
    fn check_forward(&self, key: &Key, primary_key: Option<&Key>) -> StoreResult<()> {
        let position = self.position.lock();
        let (Some(current), Some(current_primary)) = (&position.key, &position.primary_key) else {
            return Ok(());
        };
        let reverse = self.direction.is_reverse();
        let ahead = |a: &Key, b: &Key| if reverse { a < b } else { a > b };
        let ok = match primary_key {
            None => ahead(key, current),
            Some(p) => ahead(key, current) || (key == current && ahead(p, current_primary)),
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::data(
                "continue key does not move in the cursor's direction",
            ))
        }
    }

    fn writable_position(&self) -> StoreResult<Key> {
        if self.tx.mode() == TransactionMode::ReadOnly {
            return Err(StoreError::ReadOnly("cursor is in a read-only transaction".into()));
        }
        if self.tx.is_finishing() {
            return Err(StoreError::TransactionInactive("transaction has finished".into()));
        }
        if self.key_only {
            return Err(StoreError::invalid_state("key cursors cannot modify records"));
        }
        let position = self.position.lock();
        match (&position.primary_key, position.got_value) {
            (Some(primary), true) => Ok(primary.clone()),
            _ => Err(StoreError::invalid_state("cursor is not positioned on a record")),
        }
    }
}

fn result_level(key_only: bool) -> ResultLevel {
    if key_only {
        ResultLevel::OnlyKeys
    } else {
        ResultLevel::Full
    }
}
