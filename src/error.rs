//! Error types for the quota store.

use thiserror::Error;

/// Errors surfaced by quota store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operation submitted after the store was closed.
    #[error("quota store is closed")]
    Closed,

    /// No tile set with the given id exists.
    #[error("tile set does not exist: {0}")]
    NoSuchTileSet(String),

    /// No tile set belongs to the given layer.
    #[error("no such layer: {0}")]
    NoSuchLayer(String),

    /// The wait for a unit of work was severed before its result arrived.
    #[error("interrupted while waiting for a unit of work")]
    Interrupted,

    /// The global quota row is missing while the store is open.
    #[error("quota store is not initialized: the global quota row is missing")]
    NotInitialized,

    /// A coupled accounting invariant does not hold. Fatal.
    #[error("accounting invariant violated: {0}")]
    Invariant(String),

    /// Underlying storage engine failure.
    #[error("storage failure: {0}")]
    Storage(#[from] redb::Error),

    /// Record encoding or decoding failure.
    #[error("record codec failure: {0}")]
    Codec(#[from] bincode::Error),

    /// Filesystem failure while preparing the store directory.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Storage(e.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Storage(e.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        Self::Storage(e.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(e.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        Self::Storage(e.into())
    }
}
