//! WAL record framing.
//!
//! Generalizes the bincode-framed `LogEntry` scheme `cryo::storage::log` used
//! into a richer, transaction-aware record shape: every record carries a
//! type, transaction id, its own LSN, the previous LSN in its transaction's
//! chain, a length-prefixed payload, and a trailing CRC32 over everything
//! before it.
use thiserror::Error;

pub const SENTINEL_LSN: u64 = u64::MAX;

/// Fixed portion of a record: type(1) + txn_id(8) + lsn(8) + prev_lsn(8) +
/// payload_len(4).
const FIXED_HEADER_LEN: usize = 1 + 8 + 8 + 8 + 4;
const CRC_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum WalRecordError {
    #[error("truncated wal record: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown wal record type byte {0}")]
    UnknownType(u8),
    #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalRecordType {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    Insert = 4,
    Update = 5,
    Delete = 6,
    Checkpoint = 7,
    EndOfLog = 255,
}

impl TryFrom<u8> for WalRecordType {
    type Error = WalRecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => WalRecordType::Begin,
            2 => WalRecordType::Commit,
            3 => WalRecordType::Abort,
            4 => WalRecordType::Insert,
            5 => WalRecordType::Update,
            6 => WalRecordType::Delete,
            7 => WalRecordType::Checkpoint,
            255 => WalRecordType::EndOfLog,
            other => return Err(WalRecordError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub record_type: WalRecordType,
    pub txn_id: u64,
    pub lsn: u64,
    pub prev_lsn: u64,
    pub payload: Vec<u8>,
}

impl WalRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + self.payload.len() + CRC_LEN);
        buf.push(self.record_type as u8);
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes one record from the front of `bytes`, returning it along with
    /// the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), WalRecordError> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(WalRecordError::Truncated {
                need: FIXED_HEADER_LEN,
                have: bytes.len(),
            });
        }
        let record_type = WalRecordType::try_from(bytes[0])?;
        let txn_id = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
        let lsn = u64::from_le_bytes(bytes[9..17].try_into().unwrap());
        let prev_lsn = u64::from_le_bytes(bytes[17..25].try_into().unwrap());
        let payload_len = u32::from_le_bytes(bytes[25..29].try_into().unwrap()) as usize;
        let total = FIXED_HEADER_LEN + payload_len + CRC_LEN;
        if bytes.len() < total {
            return Err(WalRecordError::Truncated {
                need: total,
                have: bytes.len(),
            });
        }
        let payload = bytes[FIXED_HEADER_LEN..FIXED_HEADER_LEN + payload_len].to_vec();
        let stored_crc = u32::from_le_bytes(
            bytes[FIXED_HEADER_LEN + payload_len..total]
                .try_into()
                .unwrap(),
        );
        let computed_crc = crc32fast::hash(&bytes[..FIXED_HEADER_LEN + payload_len]);
        if stored_crc != computed_crc {
            return Err(WalRecordError::CrcMismatch {
                stored: stored_crc,
                computed: computed_crc,
            });
        }
        Ok((
            WalRecord {
                record_type,
                txn_id,
                lsn,
                prev_lsn,
                payload,
            },
            total,
        ))
    }
}

/// Payload shared by `Insert`/`Update`/`Delete` records: collection name,
/// entity id, and optional before/after images (opaque, typically the
/// entity's serialized field map).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub collection: String,
    pub entity_id: String,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
}

fn write_lp_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn write_lp_opt_bytes(buf: &mut Vec<u8>, data: &Option<Vec<u8>>) {
    match data {
        Some(bytes) => {
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        None => buf.extend_from_slice(&u32::MAX.to_le_bytes()),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WalRecordError> {
        if self.pos + len > self.bytes.len() {
            return Err(WalRecordError::MalformedPayload(
                "payload truncated".to_string(),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, WalRecordError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_lp_string(&mut self) -> Result<String, WalRecordError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WalRecordError::MalformedPayload(e.to_string()))
    }

    fn read_lp_opt_bytes(&mut self) -> Result<Option<Vec<u8>>, WalRecordError> {
        let len = self.read_u32()?;
        if len == u32::MAX {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }
}

impl DataPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_lp_string(&mut buf, &self.collection);
        write_lp_string(&mut buf, &self.entity_id);
        write_lp_opt_bytes(&mut buf, &self.before);
        write_lp_opt_bytes(&mut buf, &self.after);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WalRecordError> {
        let mut cursor = Cursor::new(bytes);
        Ok(Self {
            collection: cursor.read_lp_string()?,
            entity_id: cursor.read_lp_string()?,
            before: cursor.read_lp_opt_bytes()?,
            after: cursor.read_lp_opt_bytes()?,
        })
    }
}

/// Payload for `Checkpoint` records: the transaction ids active at the time
/// the checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPayload {
    pub active_txn_ids: Vec<u64>,
}

impl CheckpointPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.active_txn_ids.len() * 8);
        buf.extend_from_slice(&(self.active_txn_ids.len() as u32).to_le_bytes());
        for id in &self.active_txn_ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WalRecordError> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u32()? as usize;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(u64::from_le_bytes(cursor.take(8)?.try_into().unwrap()));
        }
        Ok(Self {
            active_txn_ids: ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let payload = DataPayload {
            collection: "products".into(),
            entity_id: "products-1".into(),
            before: None,
            after: Some(b"{\"price\":1}".to_vec()),
        };
        let record = WalRecord {
            record_type: WalRecordType::Insert,
            txn_id: 7,
            lsn: 128,
            prev_lsn: SENTINEL_LSN,
            payload: payload.encode(),
        };
        let bytes = record.encode();
        let (decoded, consumed) = WalRecord::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.txn_id, 7);
        assert_eq!(decoded.record_type, WalRecordType::Insert);
        let decoded_payload = DataPayload::decode(&decoded.payload).unwrap();
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn corrupted_record_fails_crc() {
        let record = WalRecord {
            record_type: WalRecordType::Begin,
            txn_id: 1,
            lsn: 0,
            prev_lsn: SENTINEL_LSN,
            payload: vec![],
        };
        let mut bytes = record.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            WalRecord::decode(&bytes),
            Err(WalRecordError::CrcMismatch { .. })
        ));
    }
}
