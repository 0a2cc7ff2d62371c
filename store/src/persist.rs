//! # Snapshot Persistence on sled
//!
//! The engine itself is in-memory. Durability comes from writing a full
//! [`DatabaseDump`] of a database after each committed write transaction and
//! loading every dump back into a fresh [`MemoryBackend`] on startup.
//!
//! Dumps live in one sled tree, keyed by database name (UTF-8), encoded
//! with bincode.
//!
//! ```text
//! commit(tx) ──▶ after_commit("wallet") ──▶ export_database ──▶ sled "snapshots"["wallet"]
//! delete_database("wallet") ──▶ after_delete("wallet") ──▶ remove "snapshots"["wallet"]
//! ```

use std::path::Path;
use std::sync::Arc;

use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::backend::{DatabaseDump, MemoryBackend};
use crate::config::SNAPSHOT_TREE;
use crate::error::StoreResult;

/// sled-backed store of database dumps.
#[derive(Debug, Clone)]
pub struct SledSnapshots {
    db: Db,
    snapshots: Tree,
}

impl SledSnapshots {
    /// Open or create the snapshot store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory snapshot store, removed on drop. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let snapshots = db.open_tree(SNAPSHOT_TREE)?;
        Ok(Self { db, snapshots })
    }

    pub fn save(&self, dump: &DatabaseDump) -> StoreResult<()> {
        let name = dump.schema.database_name.as_bytes();
        self.snapshots.insert(name, dump.to_bytes()?)?;
        self.db.flush()?;
        debug!(database = %dump.schema.database_name, "snapshot saved");
        Ok(())
    }

    pub fn load(&self, name: &str) -> StoreResult<Option<DatabaseDump>> {
        match self.snapshots.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(DatabaseDump::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, name: &str) -> StoreResult<()> {
        self.snapshots.remove(name.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Names of every persisted database.
    pub fn names(&self) -> StoreResult<Vec<String>> {
        self.snapshots
            .iter()
            .keys()
            .map(|k| -> StoreResult<String> { Ok(String::from_utf8_lossy(&k?).into_owned()) })
            .collect()
    }

    /// Load every persisted database into `backend`.
    pub fn restore_into(&self, backend: &MemoryBackend) -> StoreResult<usize> {
        let mut restored = 0;
        for entry in self.snapshots.iter() {
            let (_, bytes) = entry?;
            backend.import_database(DatabaseDump::from_bytes(&bytes)?)?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Save the committed state of `name` from `backend`.
    pub fn save_from(&self, backend: &MemoryBackend, name: &str) -> StoreResult<()> {
        self.save(&backend.export_database(name)?)
    }

    /// Restore everything persisted, then keep persisting after every
    /// committed write transaction. Deleting a database drops its snapshot.
    pub fn attach(self, backend: &Arc<MemoryBackend>) -> StoreResult<()> {
        self.restore_into(backend)?;
        let deletions = self.clone();
        backend.set_after_delete(Arc::new(move |name: &str| {
            if let Err(e) = deletions.remove(name) {
                warn!(database = name, error = %e, "failed to remove snapshot");
            }
        }));
        let weak = Arc::downgrade(backend);
        backend.set_after_commit(Arc::new(move |name: &str| {
            let Some(backend) = weak.upgrade() else {
                return;
            };
            if let Err(e) = self.save_from(&backend, name) {
                warn!(database = name, error = %e, "failed to persist snapshot");
            }
        }));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
