//! Top-level error type.
//!
//! Each subsystem defines its own `thiserror` enum close to the code that raises
//! it (`PageError` in [`crate::storage::page`], `WalError` in
//! [`crate::storage::wal`], `IndexError` in [`crate::index`], ...). [`DocDbError`]
//! composes them with `#[from]` the way `cryo::storage::StorageError` wraps
//! `PageError`/`PagerError`, so callers of the public API only ever match on one
//! enum.
use std::io;

use thiserror::Error;

use crate::index::IndexError;
use crate::query::QueryError;
use crate::snapshot::SnapshotError;
use crate::storage::buffer_pool::BufferPoolError;
use crate::storage::page::PageError;
use crate::storage::pager::PagerError;
use crate::storage::wal::{RecoveryError, WalError};

#[derive(Debug, Error)]
pub enum DocDbError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("page error: {0}")]
    Page(#[from] PageError),

    #[error("pager error: {0}")]
    Pager(#[from] PagerError),

    #[error("buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),

    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("collection '{name}' was opened as '{expected}' but is bound to '{actual}'")]
    CollectionTypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("entity '{0}' not found")]
    EntityNotFound(String),

    #[error("entity exceeds max-entity-size ({size} > {max})")]
    EntityTooLarge { size: usize, max: usize },

    #[error("database is locked by another process (lock file: {0})")]
    DatabaseLocked(String),

    #[error("operation attempted on a closed database")]
    DatabaseDisposed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, DocDbError>;
