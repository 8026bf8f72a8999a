//! Fans entity writes across every per-field index and routes typed query
//! intents to the one index that can answer them.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::warn;

use crate::value::{Entity, Value};

use super::fulltext::FullTextConfig;
use super::ordered::unsupported;
use super::persistence::IndexPersistence;
use super::{FullTextIndex, HashIndex, IndexError, IndexIntent, IndexKind, IndexResult, OrderedIndex};

enum AnyIndex {
    Ordered(OrderedIndex),
    Hash(HashIndex),
    FullText(FullTextIndex),
}

impl AnyIndex {
    fn kind(&self) -> IndexKind {
        match self {
            AnyIndex::Ordered(_) => IndexKind::Ordered,
            AnyIndex::Hash(_) => IndexKind::Hash,
            AnyIndex::FullText(_) => IndexKind::FullText,
        }
    }

    fn cardinality(&self) -> usize {
        match self {
            AnyIndex::Ordered(i) => i.cardinality(),
            AnyIndex::Hash(i) => i.cardinality(),
            AnyIndex::FullText(i) => i.cardinality(),
        }
    }

    fn total_entries(&self) -> usize {
        match self {
            AnyIndex::Ordered(i) => i.total_entries(),
            AnyIndex::Hash(i) => i.total_entries(),
            AnyIndex::FullText(i) => i.total_entries(),
        }
    }

    fn insert(&mut self, id: &str, value: &Value) {
        match self {
            AnyIndex::Ordered(i) => i.insert(id, value),
            AnyIndex::Hash(i) => i.insert(id, value),
            AnyIndex::FullText(i) => {
                if let Value::String(text) = value {
                    i.insert(id, text);
                }
            }
        }
    }

    fn remove(&mut self, id: &str, value: &Value) {
        match self {
            AnyIndex::Ordered(i) => i.remove(id, value),
            AnyIndex::Hash(i) => i.remove(id, value),
            AnyIndex::FullText(i) => i.remove(id),
        }
    }
}

/// Owns one index per field for a single collection.
#[derive(Default)]
pub struct IndexManager {
    indexes: HashMap<String, AnyIndex>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_index(&mut self, field: &str, kind: IndexKind) -> Result<(), IndexError> {
        if self.indexes.contains_key(field) {
            return Err(IndexError::AlreadyExists(field.to_string()));
        }
        let index = match kind {
            IndexKind::Ordered => AnyIndex::Ordered(OrderedIndex::new(field)),
            IndexKind::Hash => AnyIndex::Hash(HashIndex::new(field)),
            IndexKind::FullText => {
                AnyIndex::FullText(FullTextIndex::new(field, FullTextConfig::default()))
            }
        };
        self.indexes.insert(field.to_string(), index);
        Ok(())
    }

    pub fn remove_index(&mut self, field: &str) -> Result<(), IndexError> {
        self.indexes
            .remove(field)
            .map(|_| ())
            .ok_or_else(|| IndexError::NotFound(field.to_string()))
    }

    pub fn has_index(&self, field: &str) -> bool {
        self.indexes.contains_key(field)
    }

    pub fn get_kind(&self, field: &str) -> Option<IndexKind> {
        self.indexes.get(field).map(AnyIndex::kind)
    }

    pub fn indexed_fields(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    pub fn cardinality(&self, field: &str) -> Option<usize> {
        self.indexes.get(field).map(AnyIndex::cardinality)
    }

    pub fn total_entries(&self, field: &str) -> Option<usize> {
        self.indexes.get(field).map(AnyIndex::total_entries)
    }

    /// Fans an insert across every field this entity has an index for.
    pub fn insert(&mut self, entity: &Entity) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(value) = entity.get(field) {
                index.insert(&entity.id, value);
            }
        }
    }

    pub fn remove(&mut self, entity: &Entity) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(value) = entity.get(field) {
                index.remove(&entity.id, value);
            }
        }
    }

    /// Applies a replace-by-id: removes postings for `before`'s values,
    /// inserts postings for `after`'s, per-field.
    pub fn update(&mut self, before: &Entity, after: &Entity) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(value) = before.get(field) {
                index.remove(&before.id, value);
            }
            if let Some(value) = after.get(field) {
                index.insert(&after.id, value);
            }
        }
    }

    pub fn dispatch(&self, field: &str, intent: IndexIntent) -> Result<IndexResult, IndexError> {
        let index = self
            .indexes
            .get(field)
            .ok_or_else(|| IndexError::NotFound(field.to_string()))?;
        match (index, intent) {
            (AnyIndex::Ordered(i), IndexIntent::Search(v)) => Ok(IndexResult::Ids(i.search(&v))),
            (AnyIndex::Ordered(i), IndexIntent::RangeSearch { lo, hi, include_lo, include_hi }) => {
                Ok(IndexResult::Ids(i.range_search(lo.as_ref(), hi.as_ref(), include_lo, include_hi)))
            }
            (AnyIndex::Ordered(i), IndexIntent::GreaterThan(v)) => Ok(IndexResult::Ids(i.greater_than(&v))),
            (AnyIndex::Ordered(i), IndexIntent::GreaterThanOrEqual(v)) => {
                Ok(IndexResult::Ids(i.greater_than_or_equal(&v)))
            }
            (AnyIndex::Ordered(i), IndexIntent::LessThan(v)) => Ok(IndexResult::Ids(i.less_than(&v))),
            (AnyIndex::Ordered(i), IndexIntent::LessThanOrEqual(v)) => {
                Ok(IndexResult::Ids(i.less_than_or_equal(&v)))
            }
            (AnyIndex::Ordered(i), IndexIntent::CountEquals(v)) => Ok(IndexResult::Count(i.count_equals(&v))),
            (AnyIndex::Ordered(i), IndexIntent::CountGreaterThan(v)) => {
                Ok(IndexResult::Count(i.count_greater_than(&v)))
            }
            (AnyIndex::Ordered(i), IndexIntent::CountGreaterThanOrEqual(v)) => {
                Ok(IndexResult::Count(i.count_greater_than_or_equal(&v)))
            }
            (AnyIndex::Ordered(i), IndexIntent::CountLessThan(v)) => Ok(IndexResult::Count(i.count_less_than(&v))),
            (AnyIndex::Ordered(i), IndexIntent::CountLessThanOrEqual(v)) => {
                Ok(IndexResult::Count(i.count_less_than_or_equal(&v)))
            }
            (AnyIndex::Ordered(i), IndexIntent::CountRange { lo, hi, include_lo, include_hi }) => {
                Ok(IndexResult::Count(i.count_range(lo.as_ref(), hi.as_ref(), include_lo, include_hi)))
            }
            (AnyIndex::Ordered(i), IndexIntent::ExistsEquals(v)) => Ok(IndexResult::Exists(i.exists_equals(&v))),
            (AnyIndex::Ordered(i), IndexIntent::ExistsGreaterThan(v)) => {
                Ok(IndexResult::Exists(i.exists_greater_than(&v)))
            }
            (AnyIndex::Ordered(i), IndexIntent::ExistsLessThan(v)) => Ok(IndexResult::Exists(i.exists_less_than(&v))),

            (AnyIndex::Hash(i), IndexIntent::Search(v)) => Ok(IndexResult::Ids(i.search(&v))),
            (AnyIndex::Hash(i), IndexIntent::CountEquals(v)) => Ok(IndexResult::Count(i.count_equals(&v))),
            (AnyIndex::Hash(i), IndexIntent::ExistsEquals(v)) => Ok(IndexResult::Exists(i.exists_equals(&v))),

            (AnyIndex::FullText(i), IndexIntent::FullTextTerm(t)) => Ok(IndexResult::Ids(i.term(&t))),
            (AnyIndex::FullText(i), IndexIntent::FullTextAll(ts)) => Ok(IndexResult::Ids(i.all_terms(&ts))),
            (AnyIndex::FullText(i), IndexIntent::FullTextAny(ts)) => Ok(IndexResult::Ids(i.any_term(&ts))),
            (AnyIndex::FullText(i), IndexIntent::FullTextPhrase(p)) => Ok(IndexResult::Ids(i.phrase(&p))),
            (AnyIndex::FullText(i), IndexIntent::FullTextPrefix(p)) => Ok(IndexResult::Ids(i.prefix(&p))),
            (AnyIndex::FullText(i), IndexIntent::FullTextProximity(ts, d)) => {
                Ok(IndexResult::Ids(i.proximity(&ts, d)))
            }
            (AnyIndex::FullText(i), IndexIntent::FullTextRanked(ts)) => Ok(IndexResult::Ranked(i.ranked(&ts))),

            (index, _) => Err(unsupported(field, index.kind())),
        }
    }

    pub fn save(&self, dir: impl AsRef<Path>, collection: &str) {
        let dir = dir.as_ref();
        for (field, index) in &self.indexes {
            let path = index_path(dir, collection, field);
            let result = match index {
                AnyIndex::Ordered(i) => IndexPersistence::save_ordered(&path, field, i),
                AnyIndex::Hash(i) => IndexPersistence::save_hash(&path, field, i),
                AnyIndex::FullText(i) => IndexPersistence::save_fulltext(&path, field, i),
            };
            if let Err(err) = result {
                warn!("failed to persist index for field '{field}': {err}");
            }
        }
    }

    pub fn load(&mut self, dir: impl AsRef<Path>, collection: &str) -> Result<(), IndexError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(field) = field_for_collection(&path, collection) else {
                continue;
            };
            if let Some(loaded) = IndexPersistence::load(&path)? {
                let index = match loaded {
                    super::persistence::LoadedIndex::Ordered(i) => AnyIndex::Ordered(i),
                    super::persistence::LoadedIndex::Hash(i) => AnyIndex::Hash(i),
                    super::persistence::LoadedIndex::FullText(i) => AnyIndex::FullText(i),
                };
                self.indexes.insert(field, index);
            }
        }
        Ok(())
    }
}

fn index_path(dir: &Path, collection: &str, field: &str) -> PathBuf {
    dir.join(format!("{collection}_{field}.idx"))
}

fn field_for_collection(path: &Path, collection: &str) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let prefix = format!("{collection}_");
    stem.strip_prefix(&prefix).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entity(id: &str, price: i64) -> Entity {
        let mut fields = BTreeMap::new();
        fields.insert("price".to_string(), Value::Int(price));
        Entity::new(id, fields)
    }

    #[test]
    fn create_twice_is_rejected() {
        let mut mgr = IndexManager::new();
        mgr.create_index("price", IndexKind::Ordered).unwrap();
        assert!(matches!(
            mgr.create_index("price", IndexKind::Ordered),
            Err(IndexError::AlreadyExists(_))
        ));
    }

    #[test]
    fn insert_and_dispatch_search() {
        let mut mgr = IndexManager::new();
        mgr.create_index("price", IndexKind::Ordered).unwrap();
        mgr.insert(&entity("a", 10));
        mgr.insert(&entity("b", 20));
        let result = mgr.dispatch("price", IndexIntent::CountGreaterThan(Value::Int(5))).unwrap();
        assert!(matches!(result, IndexResult::Count(2)));
    }

    #[test]
    fn unsupported_intent_on_hash_surfaces_error() {
        let mut mgr = IndexManager::new();
        mgr.create_index("email", IndexKind::Hash).unwrap();
        let result = mgr.dispatch(
            "email",
            IndexIntent::RangeSearch {
                lo: None,
                hi: None,
                include_lo: true,
                include_hi: true,
            },
        );
        assert!(matches!(result, Err(IndexError::UnsupportedOperation { .. })));
    }

    #[test]
    fn update_moves_posting_between_keys() {
        let mut mgr = IndexManager::new();
        mgr.create_index("price", IndexKind::Ordered).unwrap();
        let before = entity("a", 10);
        mgr.insert(&before);
        let after = entity("a", 20);
        mgr.update(&before, &after);
        let result = mgr.dispatch("price", IndexIntent::ExistsEquals(Value::Int(10))).unwrap();
        assert!(matches!(result, IndexResult::Exists(false)));
        let result = mgr.dispatch("price", IndexIntent::ExistsEquals(Value::Int(20))).unwrap();
        assert!(matches!(result, IndexResult::Exists(true)));
    }
}
