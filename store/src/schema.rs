//! # Schema Catalog
//!
//! Pure data: database name and version, object stores and indexes. Every
//! mutation validates names and returns an error instead of half-applying.
//! Whether a mutation is *allowed right now* (version-change transaction
//! active) is the backend's business, not the catalog's.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::key_path::KeyPath;

/// Properties of one object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreProperties {
    /// In-line key path, or `None` for out-of-line keys.
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    /// Indexes owned by this store, in creation order.
    pub index_names: Vec<String>,
}

/// Properties of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProperties {
    pub key_path: KeyPath,
    pub multi_entry: bool,
    pub unique: bool,
    /// Owning object store.
    pub object_store: String,
}

/// The catalog. Index names share one namespace per database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub database_name: String,
    pub database_version: u64,
    pub object_stores: BTreeMap<String, ObjectStoreProperties>,
    pub indexes: BTreeMap<String, IndexProperties>,
}

impl Schema {
    /// An empty version-0 catalog.
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            ..Self::default()
        }
    }

    pub fn object_store(&self, name: &str) -> StoreResult<&ObjectStoreProperties> {
        self.object_stores
            .get(name)
            .ok_or_else(|| StoreError::not_found(format!("object store '{}'", name)))
    }

    pub fn index(&self, name: &str) -> StoreResult<&IndexProperties> {
        self.indexes
            .get(name)
            .ok_or_else(|| StoreError::not_found(format!("index '{}'", name)))
    }

    /// Index of `store` named `name`; fails if it exists under another store.
    pub fn store_index(&self, store: &str, name: &str) -> StoreResult<&IndexProperties> {
        let props = self.index(name)?;
        if props.object_store != store {
            return Err(StoreError::not_found(format!(
                "index '{}' on object store '{}'",
                name, store
            )));
        }
        Ok(props)
    }

    pub fn add_object_store(
        &mut self,
        name: &str,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    ) -> StoreResult<()> {
        if self.object_stores.contains_key(name) {
            return Err(StoreError::constraint(format!(
                "object store '{}' already exists",
                name
            )));
        }
        if let Some(path) = &key_path {
            path.validate()?;
            if auto_increment && (path.is_multi() || path == &KeyPath::Single(String::new())) {
                return Err(StoreError::InvalidAccess(
                    "auto-increment requires a non-empty single key path".into(),
                ));
            }
        }
        self.object_stores.insert(
            name.to_string(),
            ObjectStoreProperties {
                key_path,
                auto_increment,
                index_names: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn rename_object_store(&mut self, old: &str, new: &str) -> StoreResult<()> {
        if old == new {
            self.object_store(old)?;
            return Ok(());
        }
        if self.object_stores.contains_key(new) {
            return Err(StoreError::constraint(format!(
                "object store '{}' already exists",
                new
            )));
        }
        let props = self
            .object_stores
            .remove(old)
            .ok_or_else(|| StoreError::not_found(format!("object store '{}'", old)))?;
        for index_name in &props.index_names {
            if let Some(index) = self.indexes.get_mut(index_name) {
                index.object_store = new.to_string();
            }
        }
        self.object_stores.insert(new.to_string(), props);
        Ok(())
    }

    /// Removes the store and its indexes; returns the removed index names.
    pub fn delete_object_store(&mut self, name: &str) -> StoreResult<Vec<String>> {
        let props = self
            .object_stores
            .remove(name)
            .ok_or_else(|| StoreError::not_found(format!("object store '{}'", name)))?;
        for index_name in &props.index_names {
            self.indexes.remove(index_name);
        }
        Ok(props.index_names)
    }

    pub fn add_index(
        &mut self,
        store: &str,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> StoreResult<()> {
        key_path.validate()?;
        if multi_entry && key_path.is_multi() {
            return Err(StoreError::InvalidAccess(
                "multi-entry index cannot use an array key path".into(),
            ));
        }
        if self.indexes.contains_key(name) {
            return Err(StoreError::constraint(format!("index '{}' already exists", name)));
        }
        let store_props = self
            .object_stores
            .get_mut(store)
            .ok_or_else(|| StoreError::not_found(format!("object store '{}'", store)))?;
        store_props.index_names.push(name.to_string());
        self.indexes.insert(
            name.to_string(),
            IndexProperties {
                key_path,
                multi_entry,
                unique,
                object_store: store.to_string(),
            },
        );
        Ok(())
    }

    pub fn rename_index(&mut self, store: &str, old: &str, new: &str) -> StoreResult<()> {
        self.store_index(store, old)?;
        if old == new {
            return Ok(());
        }
        if self.indexes.contains_key(new) {
            return Err(StoreError::constraint(format!("index '{}' already exists", new)));
        }
        if let Some(props) = self.indexes.remove(old) {
            self.indexes.insert(new.to_string(), props);
        }
        if let Some(store_props) = self.object_stores.get_mut(store) {
            for n in store_props.index_names.iter_mut().filter(|n| n.as_str() == old) {
                *n = new.to_string();
            }
        }
        Ok(())
    }

    pub fn delete_index(&mut self, store: &str, name: &str) -> StoreResult<()> {
        self.store_index(store, name)?;
        self.indexes.remove(name);
        if let Some(store_props) = self.object_stores.get_mut(store) {
            store_props.index_names.retain(|n| n != name);
        }
        Ok(())
    }

    /// Every index name listed under a store exists and points back at it.
    pub fn is_consistent(&self) -> bool {
        self.object_stores.iter().all(|(store, props)| {
            props.index_names.iter().all(|i| {
                self.indexes
                    .get(i)
                    .map_or(false, |idx| &idx.object_store == store)
            })
        }) && self
            .indexes
            .values()
            .all(|idx| self.object_stores.contains_key(&idx.object_store))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn books() -> Schema {
        let mut s = Schema::new("library");
        s.add_object_store("books", Some("isbn".into()), false).unwrap();
        s.add_index("books", "by_title", "title".into(), true, false).unwrap();
        s
    }

    #[test]
    fn create_and_lookup() {
        let s = books();
        assert!(s.object_store("books").unwrap().key_path.is_some());
        assert!(s.store_index("books", "by_title").unwrap().unique);
        assert_eq!(s.object_store("nope").unwrap_err().name(), "NotFoundError");
        assert!(s.is_consistent());
    }

    #[test]
    fn name_collisions_are_constraint_errors() {
        let mut s = books();
        assert_eq!(
            s.add_object_store("books", None, false).unwrap_err().name(),
            "ConstraintError"
        );
        assert_eq!(
            s.add_index("books", "by_title", "x".into(), false, false)
                .unwrap_err()
                .name(),
            "ConstraintError"
        );
    }

    #[test]
    fn rename_store_moves_indexes() {
        let mut s = books();
        s.rename_object_store("books", "volumes").unwrap();
        assert_eq!(s.index("by_title").unwrap().object_store, "volumes");
        assert!(s.object_store("books").is_err());
        assert!(s.is_consistent());
    }

    #[test]
    fn delete_store_drops_its_indexes() {
        let mut s = books();
        let removed = s.delete_object_store("books").unwrap();
        assert_eq!(removed, vec!["by_title".to_string()]);
        assert!(s.indexes.is_empty());
        assert_eq!(s.delete_object_store("books").unwrap_err().name(), "NotFoundError");
    }

    #[test]
    fn rename_and_delete_index() {
        let mut s = books();
        s.rename_index("books", "by_title", "title_idx").unwrap();
        assert_eq!(s.object_store("books").unwrap().index_names, vec!["title_idx"]);
        s.delete_index("books", "title_idx").unwrap();
        assert!(s.object_store("books").unwrap().index_names.is_empty());
        assert!(s.is_consistent());
    }

    #[test]
    fn illegal_parameter_combinations() {
        let mut s = Schema::new("db");
        let err = s
            .add_object_store("a", Some(vec!["x", "y"].into()), true)
            .unwrap_err();
        assert_eq!(err.name(), "InvalidAccessError");
        s.add_object_store("b", None, true).unwrap();
        let err = s
            .add_index("b", "i", vec!["x", "y"].into(), false, true)
            .unwrap_err();
        assert_eq!(err.name(), "InvalidAccessError");
    }
}
