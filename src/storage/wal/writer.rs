//! Append-only WAL writer.
//!
//! Plays the same role as `cryo::storage::log::Logger`, generalized from a
//! single untransacted entry stream to a transaction-aware, LSN-tracking
//! writer: each record's LSN is the file offset it was written at, and every
//! transaction remembers the LSN of its own previous record so recovery
//! could walk a transaction's chain if it ever needed to (the engine is
//! redo-only, so today nothing walks it backwards, but the chain is
//! maintained for forward compatibility with undo).
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use log::{info, trace};
use thiserror::Error;

use super::record::{CheckpointPayload, DataPayload, WalRecord, WalRecordType, SENTINEL_LSN};

pub const WAL_FILE_MAGIC: u32 = 0x4457_414c; // "DWAL"
pub const WAL_HEADER_SIZE: usize = 16;
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 8;
const FLAG_DIRTY: u8 = 0x01;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record error: {0}")]
    Record(#[from] super::record::WalRecordError),
    #[error("unknown transaction {0}")]
    UnknownTransaction(u64),
    #[error("bad wal header magic {0:#010x}")]
    BadMagic(u32),
}

/// Appends records to the active WAL file and tracks durability metadata.
pub struct WalWriter {
    file: BufWriter<File>,
    next_txn_id: u64,
    /// Last LSN written for each still-open transaction.
    chain_heads: HashMap<u64, u64>,
    active: std::collections::HashSet<u64>,
}

impl WalWriter {
    /// Opens (creating if needed) the WAL file at `path`, writing a fresh
    /// header if the file is new.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if is_new {
            let mut header = [0u8; WAL_HEADER_SIZE];
            header[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&WAL_FILE_MAGIC.to_le_bytes());
            header[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&1u32.to_le_bytes());
            header[OFF_FLAGS] = 0;
            file.write_all(&header)?;
            file.flush()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            file: BufWriter::new(file),
            next_txn_id: 1,
            chain_heads: HashMap::new(),
            active: std::collections::HashSet::new(),
        })
    }

    fn current_lsn(&mut self) -> Result<u64, WalError> {
        Ok(self.file.stream_position()?)
    }

    fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        self.file.write_all(&record.encode())?;
        Ok(())
    }

    pub fn begin_transaction(&mut self) -> Result<u64, WalError> {
        let txn_id = self.next_txn_id;
        self.next_txn_id += 1;
        let lsn = self.current_lsn()?;
        let record = WalRecord {
            record_type: WalRecordType::Begin,
            txn_id,
            lsn,
            prev_lsn: SENTINEL_LSN,
            payload: Vec::new(),
        };
        self.append(&record)?;
        self.file.flush()?;
        self.chain_heads.insert(txn_id, lsn);
        self.active.insert(txn_id);
        trace!("wal: begin txn {txn_id} at lsn {lsn}");
        Ok(txn_id)
    }

    fn log_data(
        &mut self,
        txn_id: u64,
        record_type: WalRecordType,
        payload: DataPayload,
    ) -> Result<u64, WalError> {
        let prev_lsn = *self
            .chain_heads
            .get(&txn_id)
            .ok_or(WalError::UnknownTransaction(txn_id))?;
        let lsn = self.current_lsn()?;
        let record = WalRecord {
            record_type,
            txn_id,
            lsn,
            prev_lsn,
            payload: payload.encode(),
        };
        self.append(&record)?;
        self.file.flush()?;
        self.chain_heads.insert(txn_id, lsn);
        Ok(lsn)
    }

    pub fn log_insert(&mut self, txn_id: u64, payload: DataPayload) -> Result<u64, WalError> {
        self.log_data(txn_id, WalRecordType::Insert, payload)
    }

    pub fn log_update(&mut self, txn_id: u64, payload: DataPayload) -> Result<u64, WalError> {
        self.log_data(txn_id, WalRecordType::Update, payload)
    }

    pub fn log_delete(&mut self, txn_id: u64, payload: DataPayload) -> Result<u64, WalError> {
        self.log_data(txn_id, WalRecordType::Delete, payload)
    }

    /// Writes the commit record and fsyncs. Only once this returns `Ok` is the
    /// transaction durable.
    pub fn commit_transaction(&mut self, txn_id: u64) -> Result<(), WalError> {
        let prev_lsn = *self
            .chain_heads
            .get(&txn_id)
            .ok_or(WalError::UnknownTransaction(txn_id))?;
        let lsn = self.current_lsn()?;
        let record = WalRecord {
            record_type: WalRecordType::Commit,
            txn_id,
            lsn,
            prev_lsn,
            payload: Vec::new(),
        };
        self.append(&record)?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.chain_heads.remove(&txn_id);
        self.active.remove(&txn_id);
        info!("wal: committed txn {txn_id} at lsn {lsn}");
        Ok(())
    }

    pub fn abort_transaction(&mut self, txn_id: u64) -> Result<(), WalError> {
        let prev_lsn = *self
            .chain_heads
            .get(&txn_id)
            .ok_or(WalError::UnknownTransaction(txn_id))?;
        let lsn = self.current_lsn()?;
        let record = WalRecord {
            record_type: WalRecordType::Abort,
            txn_id,
            lsn,
            prev_lsn,
            payload: Vec::new(),
        };
        self.append(&record)?;
        self.file.flush()?;
        self.chain_heads.remove(&txn_id);
        self.active.remove(&txn_id);
        info!("wal: aborted txn {txn_id}");
        Ok(())
    }

    pub fn checkpoint(&mut self) -> Result<u64, WalError> {
        let lsn = self.current_lsn()?;
        let payload = CheckpointPayload {
            active_txn_ids: self.active.iter().copied().collect(),
        };
        let record = WalRecord {
            record_type: WalRecordType::Checkpoint,
            txn_id: 0,
            lsn,
            prev_lsn: SENTINEL_LSN,
            payload: payload.encode(),
        };
        self.append(&record)?;
        self.file.flush()?;
        Ok(lsn)
    }

    pub fn active_transactions(&self) -> impl Iterator<Item = &u64> {
        self.active.iter()
    }

    pub fn path_header_flags(path: impl AsRef<Path>) -> Result<bool, WalError> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut header = [0u8; WAL_HEADER_SIZE];
        use std::io::Read;
        file.read_exact(&mut header)?;
        let magic = u32::from_le_bytes(header[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
        if magic != WAL_FILE_MAGIC {
            return Err(WalError::BadMagic(magic));
        }
        Ok(header[OFF_FLAGS] & FLAG_DIRTY != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn begin_commit_round_trip() {
        let temp = TempDir::new("wal").unwrap();
        let path = temp.path().join("wal.log");
        let mut writer = WalWriter::open(&path).unwrap();
        let txn = writer.begin_transaction().unwrap();
        writer
            .log_insert(
                txn,
                DataPayload {
                    collection: "products".into(),
                    entity_id: "1".into(),
                    before: None,
                    after: Some(b"x".to_vec()),
                },
            )
            .unwrap();
        writer.commit_transaction(txn).unwrap();
        assert!(writer.active.is_empty());
    }

    #[test]
    fn unknown_transaction_rejected() {
        let temp = TempDir::new("wal").unwrap();
        let path = temp.path().join("wal.log");
        let mut writer = WalWriter::open(&path).unwrap();
        let err = writer.commit_transaction(999);
        assert!(matches!(err, Err(WalError::UnknownTransaction(999))));
    }
}
