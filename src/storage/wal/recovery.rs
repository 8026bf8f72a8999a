//! Crash recovery.
//!
//! The engine is redo-only: uncommitted work is simply discarded rather than
//! undone, which is possible because nothing is ever written back to the
//! paged store until its owning transaction has already committed in the
//! WAL. Recovery therefore only needs three passes over the log:
//!
//! 1. **Analysis** — scan every record once to learn which transaction ids
//!    reached a `Commit` record.
//! 2. **Redo** — scan again, applying every `Insert`/`Update`/`Delete`
//!    belonging to a committed transaction to the live store via the
//!    supplied [`RedoHandler`]. Records from transactions that never
//!    committed (or that aborted) are skipped.
//! 3. **Finalize** — report what happened so the caller can decide whether to
//!    truncate or delete the WAL file.
use std::path::Path;

use thiserror::Error;

use super::reader::WalReader;
use super::record::{CheckpointPayload, DataPayload, WalRecord, WalRecordError, WalRecordType};
use super::writer::WalError;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
    #[error("record error: {0}")]
    Record(#[from] WalRecordError),
    #[error("redo handler failed: {0}")]
    Handler(String),
}

/// Applies a redone data record to the live store. Implemented by whatever
/// owns the paged storage (the database layer), kept as a trait so this
/// module has no dependency on collection/schema types.
pub trait RedoHandler {
    fn redo_insert(&mut self, collection: &str, entity_id: &str, after: &[u8]) -> Result<(), String>;
    fn redo_update(&mut self, collection: &str, entity_id: &str, after: &[u8]) -> Result<(), String>;
    fn redo_delete(&mut self, collection: &str, entity_id: &str) -> Result<(), String>;
}

#[derive(Debug, Default, Clone)]
pub struct RecoveryResult {
    pub records_scanned: usize,
    pub transactions_committed: usize,
    pub transactions_discarded: usize,
    pub records_redone: usize,
    pub last_checkpoint: Option<CheckpointPayload>,
}

/// Runs the three-pass recovery algorithm against the WAL file at `path`,
/// applying redone operations through `handler`.
pub fn recover(
    path: impl AsRef<Path>,
    handler: &mut impl RedoHandler,
) -> Result<RecoveryResult, RecoveryError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(RecoveryResult::default());
    }

    // Pass 1: analysis.
    let mut reader = WalReader::open(path)?;
    let records = reader.read_all();

    let mut committed = std::collections::HashSet::new();
    let mut aborted = std::collections::HashSet::new();
    let mut last_checkpoint = None;
    for record in &records {
        match record.record_type {
            WalRecordType::Commit => {
                committed.insert(record.txn_id);
            }
            WalRecordType::Abort => {
                aborted.insert(record.txn_id);
            }
            WalRecordType::Checkpoint => {
                last_checkpoint = Some(CheckpointPayload::decode(&record.payload)?);
            }
            _ => {}
        }
    }

    let begun: std::collections::HashSet<u64> = records
        .iter()
        .filter(|r| r.record_type == WalRecordType::Begin)
        .map(|r| r.txn_id)
        .collect();
    let discarded = begun.difference(&committed).count();

    // Pass 2: redo.
    let mut records_redone = 0usize;
    for record in &records {
        if !matches!(
            record.record_type,
            WalRecordType::Insert | WalRecordType::Update | WalRecordType::Delete
        ) {
            continue;
        }
        if !committed.contains(&record.txn_id) || aborted.contains(&record.txn_id) {
            continue;
        }
        apply_redo(record, handler)?;
        records_redone += 1;
    }

    // Pass 3: finalize — nothing to mutate on disk here; the caller decides
    // whether to delete/truncate the WAL based on the returned summary.
    Ok(RecoveryResult {
        records_scanned: records.len(),
        transactions_committed: committed.len(),
        transactions_discarded: discarded,
        records_redone,
        last_checkpoint,
    })
}

fn apply_redo(record: &WalRecord, handler: &mut impl RedoHandler) -> Result<(), RecoveryError> {
    let payload = DataPayload::decode(&record.payload)?;
    let result = match record.record_type {
        WalRecordType::Insert => handler.redo_insert(
            &payload.collection,
            &payload.entity_id,
            payload.after.as_deref().unwrap_or_default(),
        ),
        WalRecordType::Update => handler.redo_update(
            &payload.collection,
            &payload.entity_id,
            payload.after.as_deref().unwrap_or_default(),
        ),
        WalRecordType::Delete => handler.redo_delete(&payload.collection, &payload.entity_id),
        _ => unreachable!("filtered by caller"),
    };
    result.map_err(RecoveryError::Handler)
}

#[cfg(test)]
mod tests {
    use super::super::record::DataPayload;
    use super::super::writer::WalWriter;
    use super::*;
    use tempdir::TempDir;

    #[derive(Default)]
    struct RecordingHandler {
        applied: Vec<(String, String, Option<Vec<u8>>)>,
    }

    impl RedoHandler for RecordingHandler {
        fn redo_insert(&mut self, collection: &str, entity_id: &str, after: &[u8]) -> Result<(), String> {
            self.applied
                .push((collection.into(), entity_id.into(), Some(after.to_vec())));
            Ok(())
        }
        fn redo_update(&mut self, collection: &str, entity_id: &str, after: &[u8]) -> Result<(), String> {
            self.applied
                .push((collection.into(), entity_id.into(), Some(after.to_vec())));
            Ok(())
        }
        fn redo_delete(&mut self, collection: &str, entity_id: &str) -> Result<(), String> {
            self.applied.push((collection.into(), entity_id.into(), None));
            Ok(())
        }
    }

    #[test]
    fn redoes_only_committed_transactions() {
        let temp = TempDir::new("wal").unwrap();
        let path = temp.path().join("wal.log");
        let mut writer = WalWriter::open(&path).unwrap();

        let committed_txn = writer.begin_transaction().unwrap();
        writer
            .log_insert(
                committed_txn,
                DataPayload {
                    collection: "c".into(),
                    entity_id: "1".into(),
                    before: None,
                    after: Some(b"a".to_vec()),
                },
            )
            .unwrap();
        writer.commit_transaction(committed_txn).unwrap();

        let abandoned_txn = writer.begin_transaction().unwrap();
        writer
            .log_insert(
                abandoned_txn,
                DataPayload {
                    collection: "c".into(),
                    entity_id: "2".into(),
                    before: None,
                    after: Some(b"b".to_vec()),
                },
            )
            .unwrap();
        // No commit/abort: simulates a crash mid-transaction.
        drop(writer);

        let mut handler = RecordingHandler::default();
        let result = recover(&path, &mut handler).unwrap();
        assert_eq!(result.transactions_committed, 1);
        assert_eq!(result.transactions_discarded, 1);
        assert_eq!(result.records_redone, 1);
        assert_eq!(handler.applied, vec![("c".into(), "1".into(), Some(b"a".to_vec()))]);
    }

    #[test]
    fn missing_wal_file_is_a_noop() {
        let mut handler = RecordingHandler::default();
        let result = recover("/nonexistent/path/wal.log", &mut handler).unwrap();
        assert_eq!(result.records_scanned, 0);
        assert!(handler.applied.is_empty());
    }

    #[test]
    fn aborted_transaction_is_not_redone() {
        let temp = TempDir::new("wal").unwrap();
        let path = temp.path().join("wal.log");
        let mut writer = WalWriter::open(&path).unwrap();
        let txn = writer.begin_transaction().unwrap();
        writer
            .log_delete(
                txn,
                DataPayload {
                    collection: "c".into(),
                    entity_id: "1".into(),
                    before: Some(b"a".to_vec()),
                    after: None,
                },
            )
            .unwrap();
        writer.abort_transaction(txn).unwrap();

        let mut handler = RecordingHandler::default();
        let result = recover(&path, &mut handler).unwrap();
        assert_eq!(result.records_redone, 0);
        assert!(handler.applied.is_empty());
    }
}
