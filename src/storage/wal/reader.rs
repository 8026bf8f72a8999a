//! Sequential WAL reader.
//!
//! Walks a WAL file from just past its header, decoding records one at a
//! time. Used both by recovery and by diagnostics tooling that wants to
//! inspect a log without replaying it.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::record::{WalRecord, WalRecordError};
use super::writer::{WalError, WAL_HEADER_SIZE};

pub struct WalReader {
    buf: Vec<u8>,
    pos: usize,
}

impl WalReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.len() < WAL_HEADER_SIZE {
            return Err(WalError::Record(WalRecordError::Truncated {
                need: WAL_HEADER_SIZE,
                have: buf.len(),
            }));
        }
        Ok(Self {
            buf,
            pos: WAL_HEADER_SIZE,
        })
    }

    /// Reads every well-formed record in order. Stops at the first truncated
    /// or checksum-failing record — a partial write from a crash mid-append
    /// looks exactly like this, and is not itself an error worth surfacing:
    /// it simply marks the effective end of the durable log.
    pub fn read_all(&mut self) -> Vec<WalRecord> {
        let mut records = Vec::new();
        while self.pos < self.buf.len() {
            match WalRecord::decode(&self.buf[self.pos..]) {
                Ok((record, consumed)) => {
                    self.pos += consumed;
                    records.push(record);
                }
                Err(_) => break,
            }
        }
        records
    }

    pub fn for_each(&mut self, mut f: impl FnMut(&WalRecord)) {
        for record in self.read_all() {
            f(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::record::{DataPayload, WalRecordType, SENTINEL_LSN};
    use super::super::writer::WalWriter;
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn reads_back_written_records() {
        let temp = TempDir::new("wal").unwrap();
        let path = temp.path().join("wal.log");
        let mut writer = WalWriter::open(&path).unwrap();
        let txn = writer.begin_transaction().unwrap();
        writer
            .log_insert(
                txn,
                DataPayload {
                    collection: "c".into(),
                    entity_id: "1".into(),
                    before: None,
                    after: Some(vec![1, 2, 3]),
                },
            )
            .unwrap();
        writer.commit_transaction(txn).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        let records = reader.read_all();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].record_type, WalRecordType::Begin);
        assert_eq!(records[1].record_type, WalRecordType::Insert);
        assert_eq!(records[2].record_type, WalRecordType::Commit);
        assert_eq!(records[0].prev_lsn, SENTINEL_LSN);
    }

    #[test]
    fn stops_at_truncated_tail() {
        let temp = TempDir::new("wal").unwrap();
        let path = temp.path().join("wal.log");
        let mut writer = WalWriter::open(&path).unwrap();
        let txn = writer.begin_transaction().unwrap();
        writer.commit_transaction(txn).unwrap();
        drop(writer);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        let records = reader.read_all();
        assert_eq!(records.len(), 1);
    }
}
