//! Hash-table-backed equality index. Same posting-set shape as
//! [`super::ordered::OrderedIndex`] but with no ordering, so range intents
//! are rejected rather than answered.
use std::collections::HashMap;

use crate::value::Value;

use super::ordered::unsupported;
use super::{IndexError, IndexKind};

type Posting = Vec<String>;

#[derive(Debug, Default)]
pub struct HashIndex {
    field: String,
    entries: HashMap<Value, Posting>,
}

impl HashIndex {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            entries: HashMap::new(),
        }
    }

    pub fn kind(&self) -> IndexKind {
        IndexKind::Hash
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

    pub fn range_search(&self) -> Result<Vec<String>, IndexError> {
        Err(unsupported(&self.field, IndexKind::Hash))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_search_remove_round_trips() {
        let mut index = HashIndex::new("email");
        index.insert("a", &Value::from("a@example.com"));
        assert!(index.exists_equals(&Value::from("a@example.com")));
        index.remove("a", &Value::from("a@example.com"));
        assert!(!index.exists_equals(&Value::from("a@example.com")));
    }

    #[test]
    fn range_intent_is_unsupported() {
        let index = HashIndex::new("email");
        assert!(matches!(
            index.range_search(),
            Err(IndexError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn empty_postings_are_pruned() {
        let mut index = HashIndex::new("email");
        index.insert("a", &Value::Int(1));
        index.remove("a", &Value::Int(1));
        assert_eq!(index.cardinality(), 0);
    }
}
