//! Serializable dumps of committed database state.
//!
//! The dump is the persisted representation: schema, every object store's
//! key generator and records in key order, and every index's entries. It is
//! encoding-agnostic; `serde_json` gives the human-readable form used by the
//! CLI, `bincode` the compact form kept in sled.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{IndexData, MemoryBackend, Snapshot, StoreData};
use crate::config::DUMP_FORMAT_VERSION;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::ordered_map::OrderedMap;
use crate::schema::Schema;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreDump {
    pub key_generator: u64,
    pub records: Vec<(Key, Value)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDump {
    /// `(index key, primary keys)` in index order.
    pub entries: Vec<(Key, Vec<Key>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDump {
    pub schema: Schema,
    pub object_stores: BTreeMap<String, ObjectStoreDump>,
    pub indexes: BTreeMap<String, IndexDump>,
}

/// Every database of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDump {
    pub format_version: u32,
    pub databases: BTreeMap<String, DatabaseDump>,
}

impl DatabaseDump {
    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn from_snapshot(snap: &Snapshot) -> Self {
        let object_stores = snap
            .stores
            .iter()
            .map(|(name, data)| {
                let dump = ObjectStoreDump {
                    key_generator: data.key_generator,
                    records: data
                        .records
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                };
                (name.clone(), dump)
            })
            .collect();
        let indexes = snap
            .indexes
            .iter()
            .map(|(name, data)| {
                let dump = IndexDump {
                    entries: data
                        .entries
                        .iter()
                        .map(|(k, primaries)| (k.clone(), primaries.iter().map(|(p, _)| p.clone()).collect()))
                        .collect(),
                };
                (name.clone(), dump)
            })
            .collect();
        Self {
            schema: snap.schema.clone(),
            object_stores,
            indexes,
        }
    }

    fn into_snapshot(self) -> StoreResult<Snapshot> {
        if !self.schema.is_consistent() {
            return Err(StoreError::Persistence(format!(
                "dump of '{}' has an inconsistent schema",
                self.schema.database_name
            )));
        }
        let mut stores = BTreeMap::new();
        for name in self.schema.object_stores.keys() {
            let data = match self.object_stores.get(name) {
                Some(d) => StoreData {
                    records: d.records.iter().cloned().collect(),
                    key_generator: d.key_generator,
                },
                None => StoreData::new(),
            };
            stores.insert(name.clone(), data);
        }
        let mut indexes = BTreeMap::new();
        for name in self.schema.indexes.keys() {
            let entries: OrderedMap<Key, OrderedMap<Key, ()>> = self
                .indexes
                .get(name)
                .map(|d| {
                    d.entries
                        .iter()
                        .map(|(k, ps)| (k.clone(), ps.iter().map(|p| (p.clone(), ())).collect()))
                        .collect()
                })
                .unwrap_or_default();
            indexes.insert(name.clone(), IndexData { entries });
        }
        Ok(Snapshot {
            schema: self.schema,
            stores,
            indexes,
        })
    }
}

impl BackendDump {
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl MemoryBackend {
    /// Committed state of one database.
    pub fn export_database(&self, name: &str) -> StoreResult<DatabaseDump> {
        let state = self.state.lock();
        let db = state
            .databases
            .get(name)
            .ok_or_else(|| StoreError::not_found(format!("database '{}'", name)))?;
        Ok(DatabaseDump::from_snapshot(&db.committed))
    }

    pub fn export_all(&self) -> BackendDump {
        let state = self.state.lock();
        BackendDump {
            format_version: DUMP_FORMAT_VERSION,
            databases: state
                .databases
                .iter()
                .map(|(name, db)| (name.clone(), DatabaseDump::from_snapshot(&db.committed)))
                .collect(),
        }
    }

    /// Replace (or create) a database from a dump. Refused while the database
    /// has open connections.
    pub fn import_database(&self, dump: DatabaseDump) -> StoreResult<()> {
        let name = dump.schema.database_name.clone();
        let snapshot = dump.into_snapshot()?;
        let version = snapshot.schema.database_version;
        {
            let mut state = self.state.lock();
            let db = state
                .databases
                .entry(name.clone())
                .or_insert_with(|| super::DatabaseState::new(&name));
            if !db.connections.is_empty() {
                return Err(StoreError::invalid_state(format!(
                    "database '{}' has open connections",
                    name
                )));
            }
            db.committed = snapshot;
        }
        info!(database = %name, version, "database imported");
        Ok(())
    }

    pub fn import_all(&self, dump: BackendDump) -> StoreResult<()> {
        if dump.format_version != DUMP_FORMAT_VERSION {
            return Err(StoreError::Persistence(format!(
                "unsupported dump format version {}",
                dump.format_version
            )));
        }
        for (_, db) in dump.databases {
            self.import_database(db)?;
        }
        Ok(())
    }
}
