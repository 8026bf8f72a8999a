//! Self-describing on-disk envelope for a single (collection, field) index.
//!
//! Generalizes the write-to-temp-then-rename pattern `cryo::storage::pager`
//! uses for its file header into an atomic save for index files: a losing
//! process never observes a half-written `.idx` file.
use std::io::Write;
use std::path::Path;

use bincode::{Decode, Encode};

use crate::value::Value;

use super::fulltext::{FullTextConfig, FullTextIndex, FullTextSnapshot};
use super::hash::HashIndex;
use super::ordered::OrderedIndex;
use super::IndexError;

const ENVELOPE_VERSION: u32 = 1;

/// Bincode-friendly mirror of [`Value`] — `Value` itself doesn't derive
/// `Encode`/`Decode` since its `Ord`/`Hash` impls are hand-written, so
/// persistence converts through this shape at the edges.
#[derive(Debug, Clone, Encode, Decode)]
enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(i64),
    String(String),
    Blob(Vec<u8>),
    List(Vec<WireValue>),
    Map(Vec<(String, WireValue)>),
}

impl From<&Value> for WireValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Timestamp(t) => WireValue::Timestamp(*t),
            Value::String(s) => WireValue::String(s.clone()),
            Value::Blob(b) => WireValue::Blob(b.clone()),
            Value::List(items) => WireValue::List(items.iter().map(WireValue::from).collect()),
            Value::Map(map) => {
                WireValue::Map(map.iter().map(|(k, v)| (k.clone(), WireValue::from(v))).collect())
            }
        }
    }
}

impl From<WireValue> for Value {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Timestamp(t) => Value::Timestamp(t),
            WireValue::String(s) => Value::String(s),
            WireValue::Blob(b) => Value::Blob(b),
            WireValue::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            WireValue::Map(entries) => {
                Value::Map(entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[derive(Debug, Encode, Decode)]
enum Envelope {
    Ordered {
        version: u32,
        field: String,
        entries: Vec<(WireValue, Vec<String>)>,
    },
    Hash {
        version: u32,
        field: String,
        entries: Vec<(WireValue, Vec<String>)>,
    },
    FullText {
        version: u32,
        field: String,
        min_token_length: usize,
        max_token_length: usize,
        case_sensitive: bool,
        enable_positions: bool,
        forward: Vec<(String, Vec<String>)>,
        inverted: Vec<(String, Vec<(String, Vec<usize>)>)>,
    },
}

pub enum LoadedIndex {
    Ordered(OrderedIndex),
    Hash(HashIndex),
    FullText(FullTextIndex),
}

pub struct IndexPersistence;

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let tmp = path.with_extension("idx.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl IndexPersistence {
    pub fn save_ordered(path: &Path, field: &str, index: &OrderedIndex) -> Result<(), IndexError> {
        let entries = index
            .to_entries()
            .into_iter()
            .map(|(k, v)| (WireValue::from(&k), v))
            .collect();
        let envelope = Envelope::Ordered {
            version: ENVELOPE_VERSION,
            field: field.to_string(),
            entries,
        };
        let bytes = bincode::encode_to_vec(&envelope, bincode_config())
            .map_err(|e| IndexError::InvalidFormat(e.to_string()))?;
        write_atomic(path, &bytes)
    }

    pub fn save_hash(path: &Path, field: &str, index: &HashIndex) -> Result<(), IndexError> {
        let entries = index
            .to_entries()
            .into_iter()
            .map(|(k, v)| (WireValue::from(&k), v))
            .collect();
        let envelope = Envelope::Hash {
            version: ENVELOPE_VERSION,
            field: field.to_string(),
            entries,
        };
        let bytes = bincode::encode_to_vec(&envelope, bincode_config())
            .map_err(|e| IndexError::InvalidFormat(e.to_string()))?;
        write_atomic(path, &bytes)
    }

    pub fn save_fulltext(path: &Path, field: &str, index: &FullTextIndex) -> Result<(), IndexError> {
        let snapshot = index.to_map();
        let config = index.config();
        let envelope = Envelope::FullText {
            version: ENVELOPE_VERSION,
            field: field.to_string(),
            min_token_length: config.min_token_length,
            max_token_length: config.max_token_length,
            case_sensitive: config.case_sensitive,
            enable_positions: config.enable_positions,
            forward: snapshot.forward.into_iter().collect(),
            inverted: snapshot
                .inverted
                .into_iter()
                .map(|(term, postings)| (term, postings.into_iter().collect()))
                .collect(),
        };
        let bytes = bincode::encode_to_vec(&envelope, bincode_config())
            .map_err(|e| IndexError::InvalidFormat(e.to_string()))?;
        write_atomic(path, &bytes)
    }

    /// Returns `Ok(None)` for a missing file — that is not an error, just an
    /// index that has never been persisted.
    pub fn load(path: &Path) -> Result<Option<LoadedIndex>, IndexError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let (envelope, _): (Envelope, usize) = bincode::decode_from_slice(&bytes, bincode_config())
            .map_err(|e| IndexError::InvalidFormat(e.to_string()))?;
        Ok(Some(match envelope {
            Envelope::Ordered { field, entries, .. } => {
                let entries = entries.into_iter().map(|(k, v)| (Value::from(k), v)).collect();
                LoadedIndex::Ordered(OrderedIndex::from_entries(field, entries))
            }
            Envelope::Hash { field, entries, .. } => {
                let entries = entries.into_iter().map(|(k, v)| (Value::from(k), v)).collect();
                LoadedIndex::Hash(HashIndex::from_entries(field, entries))
            }
            Envelope::FullText {
                field,
                min_token_length,
                max_token_length,
                case_sensitive,
                enable_positions,
                forward,
                inverted,
                ..
            } => {
                let config = FullTextConfig {
                    min_token_length,
                    max_token_length,
                    case_sensitive,
                    separators: Vec::new(),
                    stop_words: Default::default(),
                    enable_positions,
                };
                let snapshot = FullTextSnapshot {
                    forward: forward.into_iter().collect(),
                    inverted: inverted
                        .into_iter()
                        .map(|(term, postings)| (term, postings.into_iter().collect()))
                        .collect(),
                };
                LoadedIndex::FullText(FullTextIndex::from_map(field, config, snapshot))
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn ordered_index_round_trips_through_disk() {
        let temp = TempDir::new("idx").unwrap();
        let path = temp.path().join("products_price.idx");
        let mut index = OrderedIndex::new("price");
        index.insert("a", &Value::Int(10));
        index.insert("b", &Value::Int(20));
        IndexPersistence::save_ordered(&path, "price", &index).unwrap();

        let loaded = IndexPersistence::load(&path).unwrap().unwrap();
        let LoadedIndex::Ordered(loaded) = loaded else {
            panic!("expected ordered index");
        };
        assert_eq!(loaded.search(&Value::Int(10)), vec!["a"]);
    }

    #[test]
    fn missing_file_returns_none_not_error() {
        let temp = TempDir::new("idx").unwrap();
        let path = temp.path().join("missing.idx");
        assert!(IndexPersistence::load(&path).unwrap().is_none());
    }

    #[test]
    fn fulltext_index_round_trips() {
        let temp = TempDir::new("idx").unwrap();
        let path = temp.path().join("docs_content.idx");
        let mut index = FullTextIndex::new("content", FullTextConfig::default());
        index.insert("doc-1", "quick brown fox");
        IndexPersistence::save_fulltext(&path, "content", &index).unwrap();

        let loaded = IndexPersistence::load(&path).unwrap().unwrap();
        let LoadedIndex::FullText(loaded) = loaded else {
            panic!("expected fulltext index");
        };
        assert_eq!(loaded.term("quick"), vec!["doc-1"]);
    }
}
