//! Write-ahead log: framing, append-only writing, sequential reading, and
//! crash recovery.
//!
//! Generalizes `cryo::storage::log` (a single flat stream of bincode-framed
//! entries, replayed wholesale on open) into a transaction-aware,
//! checksum-verified log with redo-only crash recovery.
pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

pub use reader::WalReader;
pub use record::{
    CheckpointPayload, DataPayload, WalRecord, WalRecordError, WalRecordType, SENTINEL_LSN,
};
pub use recovery::{recover, RecoveryError, RecoveryResult, RedoHandler};
pub use writer::{WalError, WalWriter};
