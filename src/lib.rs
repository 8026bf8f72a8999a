//! An embeddable, single-process document database: paged on-disk storage,
//! a write-ahead log with redo-only crash recovery, secondary indexes
//! (ordered/hash/full-text), a cost-based query planner, and binary
//! snapshot/backup files.
//!
//! Start with [`Database::open`] or [`Database::in_memory`]; everything else
//! hangs off the [`Database`] or the [`collection::Collection`]s it hands
//! back.
pub mod collection;
pub mod config;
pub mod database;
pub mod error;
pub mod id;
pub mod index;
pub mod query;
pub mod snapshot;
pub mod storage;
pub mod value;

pub use collection::Collection;
pub use config::{DbConfig, RecoveryMode, StorageBackend};
pub use database::Database;
pub use error::{DocDbError, Result};
pub use id::{CounterIdGenerator, IdGenerator};
pub use index::IndexKind;
pub use query::Predicate;
pub use snapshot::{Snapshot, SnapshotError, SnapshotKind, SnapshotManager};
pub use value::{Entity, Value};
