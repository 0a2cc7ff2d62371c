//! Storage engine error taxonomy.
//!
//! Every failure the engine reports carries a stable kind name (the
//! `DataError`, `ConstraintError`, ... vocabulary callers already know from
//! indexed object-store databases), so callers branch on [`ErrorKind`] and
//! never on message text.

use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Error Kind
// ---------------------------------------------------------------------------

/// Stable, `Copy` discriminant of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Data,
    Constraint,
    InvalidState,
    InvalidAccess,
    NotFound,
    TransactionInactive,
    ReadOnly,
    Abort,
    Version,
    Persistence,
}

impl ErrorKind {
    /// The stable kind name, e.g. `"ConstraintError"`.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Data => "DataError",
            ErrorKind::Constraint => "ConstraintError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::InvalidAccess => "InvalidAccessError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::TransactionInactive => "TransactionInactiveError",
            ErrorKind::ReadOnly => "ReadOnlyError",
            ErrorKind::Abort => "AbortError",
            ErrorKind::Version => "VersionError",
            ErrorKind::Persistence => "PersistenceError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors produced by the storage engine.
///
/// `Clone` because a single failure may have to be delivered to several
/// waiters: the failing request, the transaction's completion signal and
/// every request that was still queued when the transaction aborted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// A key, key path or value is not acceptable.
    #[error("DataError: {0}")]
    Data(String),

    /// Duplicate primary key or duplicate value in a unique index.
    #[error("ConstraintError: {0}")]
    Constraint(String),

    /// The operation is not legal in the current state of the object.
    #[error("InvalidStateError: {0}")]
    InvalidState(String),

    /// Illegal parameter combination (e.g. auto-increment with an array key path).
    #[error("InvalidAccessError: {0}")]
    InvalidAccess(String),

    /// Missing database, object store or index.
    #[error("NotFoundError: {0}")]
    NotFound(String),

    /// The owning transaction no longer accepts requests.
    #[error("TransactionInactiveError: {0}")]
    TransactionInactive(String),

    /// Write attempted inside a read-only transaction.
    #[error("ReadOnlyError: {0}")]
    ReadOnly(String),

    /// The transaction was aborted before the request could run.
    #[error("AbortError: {0}")]
    Abort(String),

    /// The requested database version is lower than the stored one.
    #[error("VersionError: requested version {requested} is lower than stored version {stored}")]
    Version { requested: u64, stored: u64 },

    /// Snapshot encoding or snapshot store failure.
    #[error("PersistenceError: {0}")]
    Persistence(String),
}

/// Convenience alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Data(_) => ErrorKind::Data,
            StoreError::Constraint(_) => ErrorKind::Constraint,
            StoreError::InvalidState(_) => ErrorKind::InvalidState,
            StoreError::InvalidAccess(_) => ErrorKind::InvalidAccess,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::TransactionInactive(_) => ErrorKind::TransactionInactive,
            StoreError::ReadOnly(_) => ErrorKind::ReadOnly,
            StoreError::Abort(_) => ErrorKind::Abort,
            StoreError::Version { .. } => ErrorKind::Version,
            StoreError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Shorthand for `self.kind().name()`.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub(crate) fn data(msg: impl Into<String>) -> Self {
        StoreError::Data(msg.into())
    }

    pub(crate) fn constraint(msg: impl Into<String>) -> Self {
        StoreError::Constraint(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        StoreError::NotFound(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        StoreError::InvalidState(msg.into())
    }
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Persistence(format!("sled: {}", e))
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Persistence(format!("bincode: {}", e))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Persistence(format!("json: {}", e))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
