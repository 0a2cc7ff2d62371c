// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Coffer Store: Transactional Object Stores
//!
//! An embeddable key/value engine with the semantics of indexed object-store
//! databases: named object stores, secondary indexes (unique and
//! multi-entry), key ranges, cursors and transactions with queued
//! asynchronous requests. Small enough to read in an afternoon, strict
//! enough to hold a wallet's money.
//!
//! ## Architecture
//!
//! ```text
//!   Factory ─open─▶ Database ─transaction─▶ Transaction ─▶ ObjectStore / Index / Cursor
//!                      │                         │
//!              scheduler task            command queue (Request futures)
//!                      └──────────┬──────────────┘
//!                                 ▼
//!                           MemoryBackend ──after_commit──▶ SledSnapshots
//!                                 │
//!                 Snapshot { Schema, OrderedMap per store / index }
//! ```
//!
//! - **ordered_map**: persistent AVL tree. Writers path-copy, readers keep
//!   their snapshot for free.
//! - **key / key_path / value / range**: the key codec. Total key order,
//!   key extraction and injection, record values and key ranges.
//! - **schema**: the catalog. Pure data with validation.
//! - **backend**: connections, admission, snapshots, record operations,
//!   dumps.
//! - **transaction / database / object_store / cursor**: the async facade
//!   and its per-connection scheduler.
//! - **persist**: sled-backed snapshot store.
//! - **config**: engine constants.
//!
//! ## Quick Tour
//!
//! ```no_run
//! # async fn tour() -> coffer_store::StoreResult<()> {
//! use coffer_store::{Factory, IndexOptions, Key, StoreError, TransactionMode, Value};
//!
//! let factory = Factory::new();
//! let db = factory
//!     .open("library", 1, |vc| async move {
//!         let books = vc.create_keyed_store("books", "isbn")?;
//!         books.create_index("by_title", "title", IndexOptions::unique())?;
//!         Ok::<(), StoreError>(())
//!     })
//!     .await?;
//!
//! let tx = db.transaction(&["books"], TransactionMode::ReadWrite)?;
//! let books = tx.object_store("books")?;
//! books
//!     .put(Value::object().with_field("isbn", 1).with_field("title", "Dune"), None)
//!     .await?;
//! let dune = books.index("by_title")?.get(Key::from("Dune")).await?;
//! assert!(dune.is_some());
//! drop(books);
//! tx.done().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod cursor;
pub mod database;
pub mod error;
pub mod key;
pub mod key_path;
pub mod object_store;
pub mod ordered_map;
pub mod persist;
pub mod range;
pub mod schema;
pub mod transaction;
pub mod value;

pub use backend::{
    BackendDump, CursorDirection, DatabaseDump, MemoryBackend, ResultLevel, TransactionMode,
};
pub use cursor::Cursor;
pub use database::{Database, Factory, VersionChange};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use key::{to_valid_key, Key};
pub use key_path::KeyPath;
pub use object_store::{Index, IndexOptions, ObjectStore, ObjectStoreOptions};
pub use ordered_map::OrderedMap;
pub use persist::SledSnapshots;
pub use range::KeyRange;
pub use schema::{IndexProperties, ObjectStoreProperties, Schema};
pub use transaction::{Completion, ErrorPolicy, Request, Transaction, TransactionOutcome, TxState};
pub use value::Value;
