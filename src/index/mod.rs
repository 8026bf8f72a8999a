//! Secondary indexes over entity fields: ordered, hash, and full-text, fanned
//! out and dispatched by a single [`manager::IndexManager`].
//!
//! `cryo`'s storage layer has no equivalent — it is a fixed-schema row store
//! with no secondary indexing — so this subsystem is designed from scratch
//! against the intent enums and tie-break rules it specifies, in the same
//! `thiserror`/trait-object idiom the rest of this crate uses.
pub mod fulltext;
pub mod hash;
pub mod manager;
pub mod ordered;
pub mod persistence;

use thiserror::Error;

use crate::value::Value;

pub use fulltext::{FullTextConfig, FullTextIndex};
pub use hash::HashIndex;
pub use manager::IndexManager;
pub use ordered::OrderedIndex;
pub use persistence::IndexPersistence;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index already exists on field '{0}'")]
    AlreadyExists(String),
    #[error("no index on field '{0}'")]
    NotFound(String),
    #[error("index on field '{field}' (kind {kind:?}) does not support this operation")]
    UnsupportedOperation { field: String, kind: IndexKind },
    #[error("invalid index file format: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Ordered,
    Hash,
    FullText,
}

/// Typed query intents an index may be asked to answer. IndexManager routes
/// these to the concrete index behind a field name; a kind that cannot serve
/// an intent returns [`IndexError::UnsupportedOperation`].
#[derive(Debug, Clone)]
pub enum IndexIntent {
    Search(Value),
    RangeSearch {
        lo: Option<Value>,
        hi: Option<Value>,
        include_lo: bool,
        include_hi: bool,
    },
    GreaterThan(Value),
    GreaterThanOrEqual(Value),
    LessThan(Value),
    LessThanOrEqual(Value),
    CountEquals(Value),
    CountGreaterThan(Value),
    CountGreaterThanOrEqual(Value),
    CountLessThan(Value),
    CountLessThanOrEqual(Value),
    CountRange {
        lo: Option<Value>,
        hi: Option<Value>,
        include_lo: bool,
        include_hi: bool,
    },
    ExistsEquals(Value),
    ExistsGreaterThan(Value),
    ExistsLessThan(Value),
    FullTextTerm(String),
    FullTextAll(Vec<String>),
    FullTextAny(Vec<String>),
    FullTextPhrase(String),
    FullTextPrefix(String),
    FullTextProximity(Vec<String>, usize),
    FullTextRanked(Vec<String>),
}

/// Outcome of dispatching an [`IndexIntent`]. Count/exists intents collapse
/// to scalar results so callers don't materialize an id-list just to count
/// or check it.
#[derive(Debug, Clone)]
pub enum IndexResult {
    Ids(Vec<String>),
    Count(usize),
    Exists(bool),
    Ranked(Vec<(String, f64)>),
}

impl IndexResult {
    pub fn into_ids(self) -> Vec<String> {
        match self {
            IndexResult::Ids(ids) => ids,
            IndexResult::Ranked(scored) => scored.into_iter().map(|(id, _)| id).collect(),
            IndexResult::Count(_) | IndexResult::Exists(_) => Vec::new(),
        }
    }
}
