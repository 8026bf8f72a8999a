//! Sorted key to entity-id-set index, backed by a [`BTreeMap`].
use std::collections::BTreeMap;

use crate::value::Value;

use super::{IndexError, IndexKind};

/// Posting set for a single key. A `Vec` rather than a `HashSet` preserves
/// insertion order, matching the documented (implementation-defined but
/// stable) tie-break for ids sharing a key.
type Posting = Vec<String>;

#[derive(Debug, Default)]
pub struct OrderedIndex {
    field: String,
    entries: BTreeMap<Value, Posting>,
}

impl OrderedIndex {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> IndexKind {
        IndexKind::Ordered
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn cardinality(&self) -> usize {
        self.entries.len()
    }

    pub fn total_entries(&self) -> usize {
        self.entries.values().map(|p| p.len()).sum()
    }

    /// Indexes `id` under `value`; a `Value::Null` is never indexed.
    pub fn insert(&mut self, id: &str, value: &Value) {
        if matches!(value, Value::Null) {
            return;
        }
        let posting = self.entries.entry(value.clone()).or_default();
        if !posting.iter().any(|existing| existing == id) {
            posting.push(id.to_string());
        }
    }

    pub fn remove(&mut self, id: &str, value: &Value) {
        if matches!(value, Value::Null) {
            return;
        }
        if let Some(posting) = self.entries.get_mut(value) {
            posting.retain(|existing| existing != id);
            if posting.is_empty() {
                self.entries.remove(value);
            }
        }
    }

    pub fn search(&self, value: &Value) -> Vec<String> {
        self.entries.get(value).cloned().unwrap_or_default()
    }

    pub fn count_equals(&self, value: &Value) -> usize {
        self.entries.get(value).map(Vec::len).unwrap_or(0)
    }

    pub fn exists_equals(&self, value: &Value) -> bool {
        self.entries.contains_key(value)
    }

    pub fn exists_greater_than(&self, value: &Value) -> bool {
        self.entries.keys().next_back().is_some_and(|max| max > value)
    }

    pub fn exists_less_than(&self, value: &Value) -> bool {
        self.entries.keys().next().is_some_and(|min| min < value)
    }

    /// Inclusive/exclusive range scan; `lo`/`hi` of `None` is unbounded.
    /// Early-terminates as soon as the upper bound is crossed, which
    /// `BTreeMap::range` gives us for free by construction.
    pub fn range_search(
        &self,
        lo: Option<&Value>,
        hi: Option<&Value>,
        include_lo: bool,
        include_hi: bool,
    ) -> Vec<String> {
        self.matching_range(lo, hi, include_lo, include_hi)
            .flat_map(|(_, posting)| posting.iter().cloned())
            .collect()
    }

    pub fn count_range(
        &self,
        lo: Option<&Value>,
        hi: Option<&Value>,
        include_lo: bool,
        include_hi: bool,
    ) -> usize {
        self.matching_range(lo, hi, include_lo, include_hi)
            .map(|(_, posting)| posting.len())
            .sum()
    }

    pub fn greater_than(&self, value: &Value) -> Vec<String> {
        self.range_search(Some(value), None, false, false)
    }

    pub fn greater_than_or_equal(&self, value: &Value) -> Vec<String> {
        self.range_search(Some(value), None, true, false)
    }

    pub fn less_than(&self, value: &Value) -> Vec<String> {
        self.range_search(None, Some(value), false, false)
    }

    pub fn less_than_or_equal(&self, value: &Value) -> Vec<String> {
        self.range_search(None, Some(value), false, true)
    }

    pub fn count_greater_than(&self, value: &Value) -> usize {
        self.count_range(Some(value), None, false, false)
    }

    pub fn count_greater_than_or_equal(&self, value: &Value) -> usize {
        self.count_range(Some(value), None, true, false)
    }

    pub fn count_less_than(&self, value: &Value) -> usize {
        self.count_range(None, Some(value), false, false)
    }

    pub fn count_less_than_or_equal(&self, value: &Value) -> usize {
        self.count_range(None, Some(value), false, true)
    }

    fn matching_range<'a>(
        &'a self,
        lo: Option<&'a Value>,
        hi: Option<&'a Value>,
        include_lo: bool,
        include_hi: bool,
    ) -> impl Iterator<Item = (&'a Value, &'a Posting)> {
        self.entries.iter().filter(move |(key, _)| {
            let above_lo = match lo {
                None => true,
                Some(lo) => {
                    if include_lo {
                        *key >= lo
                    } else {
                        *key > lo
                    }
                }
            };
            let below_hi = match hi {
                None => true,
                Some(hi) => {
                    if include_hi {
                        *key <= hi
                    } else {
                        *key < hi
                    }
                }
            };
            above_lo && below_hi
        })
    }

    pub fn to_entries(&self) -> Vec<(Value, Vec<String>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn from_entries(field: impl Into<String>, entries: Vec<(Value, Vec<String>)>) -> Self {
        Self {
            field: field.into(),
            entries: entries.into_iter().collect(),
        }
    }
}

pub fn unsupported(field: &str, kind: IndexKind) -> IndexError {
    IndexError::UnsupportedOperation {
        field: field.to_string(),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_search_round_trips() {
        let mut index = OrderedIndex::new("price");
        index.insert("a", &Value::Int(10));
        index.insert("b", &Value::Int(10));
        index.insert("c", &Value::Int(20));
        assert_eq!(index.search(&Value::Int(10)), vec!["a", "b"]);
        assert_eq!(index.count_equals(&Value::Int(20)), 1);
    }

    #[test]
    fn null_values_are_never_indexed() {
        let mut index = OrderedIndex::new("price");
        index.insert("a", &Value::Null);
        assert_eq!(index.cardinality(), 0);
        assert!(!index.exists_equals(&Value::Null));
    }

    #[test]
    fn remove_drops_empty_keys() {
        let mut index = OrderedIndex::new("price");
        index.insert("a", &Value::Int(10));
        index.remove("a", &Value::Int(10));
        assert_eq!(index.cardinality(), 0);
        // second remove is a no-op, not an error or panic
        index.remove("a", &Value::Int(10));
    }

    #[test]
    fn range_search_respects_bounds() {
        let mut index = OrderedIndex::new("price");
        for i in 0..10 {
            index.insert(&i.to_string(), &Value::Int(i));
        }
        let ids = index.range_search(Some(&Value::Int(3)), Some(&Value::Int(7)), true, false);
        assert_eq!(ids, vec!["3", "4", "5", "6"]);
    }

    #[test]
    fn unbounded_range_returns_all() {
        let mut index = OrderedIndex::new("price");
        index.insert("a", &Value::Int(1));
        index.insert("b", &Value::Int(2));
        assert_eq!(index.range_search(None, None, true, true).len(), 2);
    }
}
