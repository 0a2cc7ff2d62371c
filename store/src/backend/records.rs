//! Record-level operations on a [`Snapshot`]: stores, deletes, scans and
//! index maintenance. Every method either applies completely or returns an
//! error with the snapshot untouched.

use std::ops::Bound;

use serde::{Deserialize, Serialize};

use super::{IndexData, Snapshot};
use crate::config::KEY_GENERATOR_MAX;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::key_path::{extract_key, index_keys, inject_key, try_extract_key, KeyPath};
use crate::ordered_map::OrderedMap;
use crate::range::{max_lower, min_upper, KeyRange};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Request Types
// ---------------------------------------------------------------------------

/// How a store request treats an existing record under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreLevel {
    /// `add`: an existing record is a `ConstraintError`.
    NoOverwrite,
    /// `put`: replace whatever is there.
    AllowOverwrite,
    /// Cursor update: the record must already exist.
    UpdateExisting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordStoreRequest {
    pub object_store: String,
    pub value: Value,
    /// Explicit (out-of-line) key.
    pub key: Option<Key>,
    pub level: StoreLevel,
}

/// Iteration direction of a scan or cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorDirection {
    #[default]
    Next,
    /// Ascending, first record per distinct index key.
    NextUnique,
    Prev,
    /// Descending, first record per distinct index key.
    PrevUnique,
}

impl CursorDirection {
    pub fn is_reverse(self) -> bool {
        matches!(self, CursorDirection::Prev | CursorDirection::PrevUnique)
    }

    pub fn is_unique(self) -> bool {
        matches!(self, CursorDirection::NextUnique | CursorDirection::PrevUnique)
    }
}

/// How much of each matching record to materialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultLevel {
    OnlyCount,
    OnlyKeys,
    #[default]
    Full,
}

/// A scan over an object store or one of its indexes.
///
/// The `last_*` fields are the position of the previous step (results start
/// strictly after it), the `advance_*` fields a target to skip forward to
/// (results start at or after it).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordGetRequest {
    pub object_store: String,
    pub index: Option<String>,
    pub range: KeyRange,
    pub direction: CursorDirection,
    pub last_index_position: Option<Key>,
    pub last_object_store_position: Option<Key>,
    pub advance_index_key: Option<Key>,
    pub advance_primary_key: Option<Key>,
    /// Maximum number of results; `0` means unlimited.
    pub limit: usize,
    pub result_level: ResultLevel,
}

impl RecordGetRequest {
    /// Full forward scan over every record of `object_store`.
    pub fn new(object_store: impl Into<String>) -> Self {
        Self {
            object_store: object_store.into(),
            index: None,
            range: KeyRange::all(),
            direction: CursorDirection::Next,
            last_index_position: None,
            last_object_store_position: None,
            advance_index_key: None,
            advance_primary_key: None,
            limit: 0,
            result_level: ResultLevel::Full,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordGetResponse {
    /// Record values (`Full` only).
    pub values: Vec<Value>,
    /// Index keys (index scans, `OnlyKeys` and `Full`).
    pub index_keys: Vec<Key>,
    /// Primary keys (`OnlyKeys` and `Full`).
    pub primary_keys: Vec<Key>,
    pub count: usize,
}

impl RecordGetResponse {
    fn push(&mut self, level: ResultLevel, index_key: Option<&Key>, primary_key: &Key, value: Option<&Value>) {
        self.count += 1;
        if level == ResultLevel::OnlyCount {
            return;
        }
        if let Some(k) = index_key {
            self.index_keys.push(k.clone());
        }
        self.primary_keys.push(primary_key.clone());
        if level == ResultLevel::Full {
            self.values.push(value.cloned().unwrap_or(Value::Undefined));
        }
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

impl Snapshot {
    pub(crate) fn store_record(&mut self, request: RecordStoreRequest) -> StoreResult<Key> {
        let RecordStoreRequest {
            object_store,
            value,
            key,
            level,
        } = request;
        let props = self.schema.object_store(&object_store)?.clone();
        let data = self
            .stores
            .get(&object_store)
            .ok_or_else(|| StoreError::not_found(format!("object store '{}'", object_store)))?;

        // Key resolution.
        let mut generator = data.key_generator;
        let (key, value) = match (&props.key_path, key) {
            (Some(path), Some(explicit)) => {
                if level != StoreLevel::UpdateExisting {
                    return Err(StoreError::data(
                        "object store uses in-line keys and an explicit key was given",
                    ));
                }
                if extract_key(&value, path)? != explicit {
                    return Err(StoreError::data("in-line key does not match the record's key"));
                }
                (explicit, value)
            }
            (Some(path), None) => match try_extract_key(&value, path)? {
                Some(k) => {
                    if props.auto_increment {
                        generator = bump_generator(generator, &k);
                    }
                    (k, value)
                }
                None if props.auto_increment => {
                    let k = generate_key(generator)?;
                    generator += 1;
                    let single = match path {
                        KeyPath::Single(p) => p,
                        KeyPath::Multi(_) => {
                            return Err(StoreError::data("cannot inject into an array key path"))
                        }
                    };
                    let injected = inject_key(&value, single, &k)?;
                    (k, injected)
                }
                None => {
                    return Err(StoreError::data(format!(
                        "key path {} did not yield a key",
                        path
                    )))
                }
            },
            (None, Some(explicit)) => {
                if props.auto_increment {
                    generator = bump_generator(generator, &explicit);
                }
                (explicit, value)
            }
            (None, None) if props.auto_increment => {
                let k = generate_key(generator)?;
                generator += 1;
                (k, value)
            }
            (None, None) => {
                return Err(StoreError::data(
                    "object store uses out-of-line keys and no key was given",
                ))
            }
        };

        let existing = data.records.get(&key).cloned();
        match (level, &existing) {
            (StoreLevel::NoOverwrite, Some(_)) => {
                return Err(StoreError::constraint(format!(
                    "a record with key {:?} already exists",
                    key
                )))
            }
            (StoreLevel::UpdateExisting, None) => {
                return Err(StoreError::not_found(format!(
                    "cannot update: no record with key {:?}",
                    key
                )))
            }
            _ => {}
        }

        // Index maintenance on local copies; nothing is assigned until every
        // index accepted the new record.
        let mut updated = Vec::with_capacity(props.index_names.len());
        for index_name in &props.index_names {
            let index_props = self.schema.index(index_name)?;
            let mut index = self.indexes.get(index_name).cloned().unwrap_or_default();
            if let Some(old) = &existing {
                for k in index_keys(old, &index_props.key_path, index_props.multi_entry) {
                    index = index.remove(&k, &key);
                }
            }
            for k in index_keys(&value, &index_props.key_path, index_props.multi_entry) {
                index = index.insert(k, key.clone(), index_props.unique)?;
            }
            updated.push((index_name.clone(), index));
        }

        for (name, index) in updated {
            self.indexes.insert(name, index);
        }
        if let Some(data) = self.stores.get_mut(&object_store) {
            data.records = data.records.inserted(key.clone(), value);
            data.key_generator = generator;
        }
        Ok(key)
    }

    pub(crate) fn delete_records(&mut self, object_store: &str, range: &KeyRange) -> StoreResult<usize> {
        let props = self.schema.object_store(object_store)?.clone();
        let data = self
            .stores
            .get_mut(object_store)
            .ok_or_else(|| StoreError::not_found(format!("object store '{}'", object_store)))?;

        let doomed: Vec<(Key, Value)> = data
            .records
            .range(range.lower_bound_ref(), range.upper_bound_ref())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, _) in &doomed {
            data.records = data.records.without(key);
        }

        for index_name in &props.index_names {
            let index_props = self.schema.index(index_name)?;
            if let Some(index) = self.indexes.get_mut(index_name) {
                for (key, value) in &doomed {
                    for k in index_keys(value, &index_props.key_path, index_props.multi_entry) {
                        *index = index.remove(&k, key);
                    }
                }
            }
        }
        Ok(doomed.len())
    }

    /// Build an index over the store's current records.
    pub(crate) fn build_index(
        &self,
        object_store: &str,
        key_path: &KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> StoreResult<IndexData> {
        let data = self
            .stores
            .get(object_store)
            .ok_or_else(|| StoreError::not_found(format!("object store '{}'", object_store)))?;
        let mut index = IndexData::default();
        for (primary, value) in data.records.iter() {
            for k in index_keys(value, key_path, multi_entry) {
                index = index.insert(k, primary.clone(), unique)?;
            }
        }
        Ok(index)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub(crate) fn get_records(&self, req: &RecordGetRequest) -> StoreResult<RecordGetResponse> {
        self.schema.object_store(&req.object_store)?;
        let data = self
            .stores
            .get(&req.object_store)
            .ok_or_else(|| StoreError::not_found(format!("object store '{}'", req.object_store)))?;

        match &req.index {
            None => Ok(scan_store(&data.records, req)),
            Some(name) => {
                self.schema.store_index(&req.object_store, name)?;
                let index = self
                    .indexes
                    .get(name)
                    .ok_or_else(|| StoreError::not_found(format!("index '{}'", name)))?;
                Ok(scan_index(index, &data.records, req))
            }
        }
    }
}

fn generate_key(generator: u64) -> StoreResult<Key> {
    if generator > KEY_GENERATOR_MAX {
        return Err(StoreError::constraint("key generator exhausted"));
    }
    Ok(Key::from(generator))
}

/// Explicit numeric keys push the generator past them.
fn bump_generator(generator: u64, key: &Key) -> u64 {
    match key.as_f64() {
        Some(n) if n >= generator as f64 => {
            let next = n.floor() + 1.0;
            if next > KEY_GENERATOR_MAX as f64 {
                KEY_GENERATOR_MAX + 1
            } else {
                next as u64
            }
        }
        _ => generator,
    }
}

fn under_limit(resp: &RecordGetResponse, limit: usize) -> bool {
    limit == 0 || resp.count < limit
}

fn scan_store(records: &OrderedMap<Key, Value>, req: &RecordGetRequest) -> RecordGetResponse {
    let reverse = req.direction.is_reverse();
    let mut lower = req.range.lower_bound_ref();
    let mut upper = req.range.upper_bound_ref();
    if let Some(last) = &req.last_object_store_position {
        if reverse {
            upper = min_upper(upper, Bound::Excluded(last));
        } else {
            lower = max_lower(lower, Bound::Excluded(last));
        }
    }
    if let Some(target) = &req.advance_primary_key {
        if reverse {
            upper = min_upper(upper, Bound::Included(target));
        } else {
            lower = max_lower(lower, Bound::Included(target));
        }
    }

    let mut resp = RecordGetResponse::default();
    if bounds_empty(lower, upper) {
        return resp;
    }
    for (key, value) in records.entries(lower, upper, reverse) {
        if !under_limit(&resp, req.limit) {
            break;
        }
        resp.push(req.result_level, None, key, Some(value));
    }
    resp
}

fn scan_index(
    index: &IndexData,
    records: &OrderedMap<Key, Value>,
    req: &RecordGetRequest,
) -> RecordGetResponse {
    let reverse = req.direction.is_reverse();
    let unique = req.direction.is_unique();

    // Outer bounds over index keys.
    let mut lower = req.range.lower_bound_ref();
    let mut upper = req.range.upper_bound_ref();
    let last = req.last_index_position.as_ref();
    // Without a primary position the whole last index key is consumed.
    let exclude_last = unique || req.last_object_store_position.is_none();
    if let Some(l) = last {
        let b = if exclude_last {
            Bound::Excluded(l)
        } else {
            Bound::Included(l)
        };
        if reverse {
            upper = min_upper(upper, b);
        } else {
            lower = max_lower(lower, b);
        }
    }
    if let Some(target) = &req.advance_index_key {
        if reverse {
            upper = min_upper(upper, Bound::Included(target));
        } else {
            lower = max_lower(lower, Bound::Included(target));
        }
    }

    let mut resp = RecordGetResponse::default();
    if bounds_empty(lower, upper) {
        return resp;
    }

    for (index_key, primaries) in index.entries.entries(lower, upper, reverse) {
        if !under_limit(&resp, req.limit) {
            break;
        }
        if unique {
            // Lowest primary key stands for the whole index key.
            if let Some((primary, _)) = primaries.first() {
                resp.push(req.result_level, Some(index_key), primary, records.get(primary));
            }
            continue;
        }

        // Inner bounds apply only on the index key being resumed or targeted.
        let mut p_lower = Bound::Unbounded;
        let mut p_upper = Bound::Unbounded;
        if let (Some(l), Some(p)) = (last, &req.last_object_store_position) {
            if l == index_key {
                if reverse {
                    p_upper = min_upper(p_upper, Bound::Excluded(p));
                } else {
                    p_lower = max_lower(p_lower, Bound::Excluded(p));
                }
            }
        }
        if let (Some(a), Some(ap)) = (&req.advance_index_key, &req.advance_primary_key) {
            if a == index_key {
                if reverse {
                    p_upper = min_upper(p_upper, Bound::Included(ap));
                } else {
                    p_lower = max_lower(p_lower, Bound::Included(ap));
                }
            }
        }
        if bounds_empty(p_lower, p_upper) {
            continue;
        }
        for (primary, _) in primaries.entries(p_lower, p_upper, reverse) {
            if !under_limit(&resp, req.limit) {
                break;
            }
            resp.push(req.result_level, Some(index_key), primary, records.get(primary));
        }
    }
    resp
}

/// True when no key can satisfy both bounds.
fn bounds_empty(lower: Bound<&Key>, upper: Bound<&Key>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StoreData;
    use crate::schema::Schema;
    use std::collections::BTreeMap;

    // -- Helpers -------------------------------------------------------------

    fn snapshot() -> Snapshot {
        let mut schema = Schema::new("t");
        schema.add_object_store("items", None, true).unwrap();
        schema
            .add_index("items", "by_tag", "tag".into(), false, false)
            .unwrap();
        schema
            .add_index("items", "by_label", "label".into(), true, false)
            .unwrap();
        let mut stores = BTreeMap::new();
        stores.insert(
            "items".to_string(),
            StoreData {
                records: OrderedMap::new(),
                key_generator: 1,
            },
        );
        let mut indexes = BTreeMap::new();
        indexes.insert("by_tag".to_string(), IndexData::default());
        indexes.insert("by_label".to_string(), IndexData::default());
        Snapshot {
            schema,
            stores,
            indexes,
        }
    }

    fn add(snap: &mut Snapshot, value: Value) -> StoreResult<Key> {
        snap.store_record(RecordStoreRequest {
            object_store: "items".into(),
            value,
            key: None,
            level: StoreLevel::NoOverwrite,
        })
    }

    fn tagged(tag: &str, label: &str) -> Value {
        Value::object().with_field("tag", tag).with_field("label", label)
    }

    fn index_req(direction: CursorDirection) -> RecordGetRequest {
        RecordGetRequest {
            index: Some("by_tag".into()),
            direction,
            result_level: ResultLevel::OnlyKeys,
            ..RecordGetRequest::new("items")
        }
    }

    fn pairs(resp: &RecordGetResponse) -> Vec<(String, f64)> {
        resp.index_keys
            .iter()
            .zip(&resp.primary_keys)
            .map(|(i, p)| (i.as_str().unwrap().to_string(), p.as_f64().unwrap()))
            .collect()
    }

    // -- Writes --------------------------------------------------------------

    #[test]
    fn generator_assigns_and_tracks_explicit_keys() {
        let mut snap = snapshot();
        assert_eq!(add(&mut snap, tagged("a", "1")).unwrap(), Key::from(1));
        let explicit = snap
            .store_record(RecordStoreRequest {
                object_store: "items".into(),
                value: tagged("a", "2"),
                key: Some(Key::number(10.5).unwrap()),
                level: StoreLevel::NoOverwrite,
            })
            .unwrap();
        assert_eq!(explicit, Key::number(10.5).unwrap());
        assert_eq!(add(&mut snap, tagged("a", "3")).unwrap(), Key::from(11));
    }

    #[test]
    fn generator_never_reuses_deleted_keys() {
        let mut snap = snapshot();
        add(&mut snap, tagged("a", "1")).unwrap();
        add(&mut snap, tagged("a", "2")).unwrap();
        assert_eq!(snap.delete_records("items", &KeyRange::all()).unwrap(), 2);
        assert_eq!(add(&mut snap, tagged("a", "3")).unwrap(), Key::from(3));
    }

    #[test]
    fn generator_exhaustion_is_constraint_error() {
        let mut snap = snapshot();
        snap.stores.get_mut("items").unwrap().key_generator = KEY_GENERATOR_MAX + 1;
        assert_eq!(add(&mut snap, tagged("a", "1")).unwrap_err().name(), "ConstraintError");
    }

    #[test]
    fn unique_violation_changes_nothing() {
        let mut snap = snapshot();
        add(&mut snap, tagged("a", "same")).unwrap();
        let before_tag = snap.indexes["by_tag"].len();
        let err = add(&mut snap, tagged("b", "same")).unwrap_err();
        assert_eq!(err.name(), "ConstraintError");
        assert_eq!(snap.stores["items"].records.len(), 1);
        assert_eq!(snap.indexes["by_tag"].len(), before_tag);
        assert_eq!(snap.stores["items"].key_generator, 2);
    }

    #[test]
    fn overwrite_replaces_index_entries() {
        let mut snap = snapshot();
        let k = add(&mut snap, tagged("a", "x")).unwrap();
        snap.store_record(RecordStoreRequest {
            object_store: "items".into(),
            value: tagged("b", "x"),
            key: Some(k.clone()),
            level: StoreLevel::AllowOverwrite,
        })
        .unwrap();
        let resp = snap.get_records(&index_req(CursorDirection::Next)).unwrap();
        assert_eq!(pairs(&resp), vec![("b".to_string(), 1.0)]);
    }

    #[test]
    fn update_existing_requires_record() {
        let mut snap = snapshot();
        let err = snap
            .store_record(RecordStoreRequest {
                object_store: "items".into(),
                value: tagged("a", "1"),
                key: Some(Key::from(42)),
                level: StoreLevel::UpdateExisting,
            })
            .unwrap_err();
        assert_eq!(err.name(), "NotFoundError");
    }

    #[test]
    fn no_overwrite_collision() {
        let mut snap = snapshot();
        add(&mut snap, tagged("a", "1")).unwrap();
        let err = snap
            .store_record(RecordStoreRequest {
                object_store: "items".into(),
                value: tagged("a", "2"),
                key: Some(Key::from(1)),
                level: StoreLevel::NoOverwrite,
            })
            .unwrap_err();
        assert_eq!(err.name(), "ConstraintError");
    }

    // -- Reads ---------------------------------------------------------------

    fn populated() -> Snapshot {
        let mut snap = snapshot();
        for (tag, label) in [("b", "1"), ("a", "2"), ("b", "3"), ("c", "4"), ("a", "5")] {
            add(&mut snap, tagged(tag, label)).unwrap();
        }
        snap
    }

    #[test]
    fn index_scan_orders_by_index_then_primary() {
        let resp = populated().get_records(&index_req(CursorDirection::Next)).unwrap();
        assert_eq!(
            pairs(&resp),
            vec![
                ("a".to_string(), 2.0),
                ("a".to_string(), 5.0),
                ("b".to_string(), 1.0),
                ("b".to_string(), 3.0),
                ("c".to_string(), 4.0),
            ]
        );
    }

    #[test]
    fn unique_directions_take_lowest_primary() {
        let snap = populated();
        let next = snap.get_records(&index_req(CursorDirection::NextUnique)).unwrap();
        assert_eq!(
            pairs(&next),
            vec![("a".to_string(), 2.0), ("b".to_string(), 1.0), ("c".to_string(), 4.0)]
        );
        let prev = snap.get_records(&index_req(CursorDirection::PrevUnique)).unwrap();
        assert_eq!(
            pairs(&prev),
            vec![("c".to_string(), 4.0), ("b".to_string(), 1.0), ("a".to_string(), 2.0)]
        );
    }

    #[test]
    fn resume_within_duplicate_index_key() {
        let snap = populated();
        let req = RecordGetRequest {
            last_index_position: Some(Key::from("a")),
            last_object_store_position: Some(Key::from(2)),
            limit: 2,
            ..index_req(CursorDirection::Next)
        };
        let resp = snap.get_records(&req).unwrap();
        assert_eq!(pairs(&resp), vec![("a".to_string(), 5.0), ("b".to_string(), 1.0)]);

        let req = RecordGetRequest {
            last_index_position: Some(Key::from("b")),
            last_object_store_position: Some(Key::from(3)),
            limit: 1,
            ..index_req(CursorDirection::Prev)
        };
        let resp = snap.get_records(&req).unwrap();
        assert_eq!(pairs(&resp), vec![("b".to_string(), 1.0)]);
    }

    #[test]
    fn advance_to_index_and_primary_key() {
        let snap = populated();
        let req = RecordGetRequest {
            advance_index_key: Some(Key::from("b")),
            advance_primary_key: Some(Key::from(2)),
            limit: 1,
            ..index_req(CursorDirection::Next)
        };
        let resp = snap.get_records(&req).unwrap();
        assert_eq!(pairs(&resp), vec![("b".to_string(), 3.0)]);
    }

    #[test]
    fn store_scan_respects_range_limit_and_direction() {
        let snap = populated();
        let req = RecordGetRequest {
            range: KeyRange::bound(2, 4, false, true).unwrap(),
            direction: CursorDirection::Prev,
            ..RecordGetRequest::new("items")
        };
        let resp = snap.get_records(&req).unwrap();
        assert_eq!(resp.primary_keys, vec![Key::from(3), Key::from(2)]);
        assert_eq!(resp.values.len(), 2);

        let count = snap
            .get_records(&RecordGetRequest {
                result_level: ResultLevel::OnlyCount,
                ..RecordGetRequest::new("items")
            })
            .unwrap();
        assert_eq!(count.count, 5);
        assert!(count.primary_keys.is_empty());
    }

    #[test]
    fn delete_range_cleans_indexes() {
        let mut snap = populated();
        let removed = snap
            .delete_records("items", &KeyRange::bound(1, 3, false, false).unwrap())
            .unwrap();
        assert_eq!(removed, 3);
        let resp = snap.get_records(&index_req(CursorDirection::Next)).unwrap();
        assert_eq!(pairs(&resp), vec![("a".to_string(), 5.0), ("c".to_string(), 4.0)]);
        assert_eq!(snap.indexes["by_label"].len(), 2);
    }
}
