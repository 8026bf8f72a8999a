//! Chooses between an index-backed plan and a full scan for a [`Predicate`],
//! and (when index-backed) actually resolves the candidate id set.
use crate::index::{IndexIntent, IndexKind, IndexManager, IndexResult};

use super::plan::{Plan, Strategy};
use super::predicate::Predicate;

pub struct Optimizer;

impl Optimizer {
    pub fn new() -> Self {
        Self
    }

    /// Returns the plan that would be chosen, without executing it.
    pub fn explain(&self, predicate: &Predicate, indexes: &IndexManager, entity_count: usize) -> Plan {
        self.plan_for(predicate, indexes, entity_count)
    }

    /// Resolves `predicate` to a candidate id set purely through indexes, or
    /// `None` if no combination of indexes can answer it (a full scan is
    /// required). When `Some` is returned the ids are a superset of the
    /// exact match only for compound predicates with a scanned residual;
    /// callers still re-check `predicate.matches` against fetched entities.
    pub fn candidate_ids(&self, predicate: &Predicate, indexes: &IndexManager) -> Option<Vec<String>> {
        match predicate {
            Predicate::Equals(field, value) => {
                dispatch_ids(indexes, field, IndexIntent::Search(value.clone()))
            }
            Predicate::GreaterThan(field, value) if is_ordered(indexes, field) => {
                dispatch_ids(indexes, field, IndexIntent::GreaterThan(value.clone()))
            }
            Predicate::GreaterThanOrEqual(field, value) if is_ordered(indexes, field) => {
                dispatch_ids(indexes, field, IndexIntent::GreaterThanOrEqual(value.clone()))
            }
            Predicate::LessThan(field, value) if is_ordered(indexes, field) => {
                dispatch_ids(indexes, field, IndexIntent::LessThan(value.clone()))
            }
            Predicate::LessThanOrEqual(field, value) if is_ordered(indexes, field) => {
                dispatch_ids(indexes, field, IndexIntent::LessThanOrEqual(value.clone()))
            }
            Predicate::Between(field, lo, hi) if is_ordered(indexes, field) => dispatch_ids(
                indexes,
                field,
                IndexIntent::RangeSearch {
                    lo: Some(lo.clone()),
                    hi: Some(hi.clone()),
                    include_lo: true,
                    include_hi: true,
                },
            ),
            Predicate::In(field, values) if indexes.has_index(field) => {
                let mut union = std::collections::HashSet::new();
                for value in values {
                    let ids = dispatch_ids(indexes, field, IndexIntent::Search(value.clone()))?;
                    union.extend(ids);
                }
                let mut ids: Vec<String> = union.into_iter().collect();
                ids.sort();
                Some(ids)
            }
            Predicate::FullText(field, query) => {
                let terms: Vec<String> = query.split_whitespace().map(str::to_string).collect();
                dispatch_ids(indexes, field, IndexIntent::FullTextAll(terms))
            }
            Predicate::FullTextAny(field, terms) => {
                dispatch_ids(indexes, field, IndexIntent::FullTextAny(terms.clone()))
            }
            Predicate::FullTextPhrase(field, phrase) => {
                dispatch_ids(indexes, field, IndexIntent::FullTextPhrase(phrase.clone()))
            }
            Predicate::FullTextPrefix(field, prefix) => {
                dispatch_ids(indexes, field, IndexIntent::FullTextPrefix(prefix.clone()))
            }
            Predicate::And(children) => self.candidate_ids_and(children, indexes),
            Predicate::Or(children) => self.candidate_ids_or(children, indexes),
            _ => None,
        }
    }

    /// Resolves `predicate` to a field + index intent that answers a count
    /// directly, with no id list ever materialized. `None` means the
    /// predicate shape has no direct count intent and the caller must fall
    /// back to resolving candidates and counting them.
    pub fn count_intent<'p>(&self, predicate: &'p Predicate) -> Option<(&'p str, IndexIntent)> {
        match predicate {
            Predicate::Equals(field, value) => Some((field, IndexIntent::CountEquals(value.clone()))),
            Predicate::GreaterThan(field, value) => {
                Some((field, IndexIntent::CountGreaterThan(value.clone())))
            }
            Predicate::GreaterThanOrEqual(field, value) => {
                Some((field, IndexIntent::CountGreaterThanOrEqual(value.clone())))
            }
            Predicate::LessThan(field, value) => Some((field, IndexIntent::CountLessThan(value.clone()))),
            Predicate::LessThanOrEqual(field, value) => {
                Some((field, IndexIntent::CountLessThanOrEqual(value.clone())))
            }
            Predicate::Between(field, lo, hi) => Some((
                field,
                IndexIntent::CountRange {
                    lo: Some(lo.clone()),
                    hi: Some(hi.clone()),
                    include_lo: true,
                    include_hi: true,
                },
            )),
            _ => None,
        }
    }

    /// Resolves `predicate` to a field + index intent that answers an
    /// existence check directly. `None` means the caller must fall back to
    /// `find_one`.
    pub fn exists_intent<'p>(&self, predicate: &'p Predicate) -> Option<(&'p str, IndexIntent)> {
        match predicate {
            Predicate::Equals(field, value) => Some((field, IndexIntent::ExistsEquals(value.clone()))),
            Predicate::GreaterThan(field, value) => {
                Some((field, IndexIntent::ExistsGreaterThan(value.clone())))
            }
            Predicate::LessThan(field, value) => Some((field, IndexIntent::ExistsLessThan(value.clone()))),
            _ => None,
        }
    }

    fn candidate_ids_and(&self, children: &[Predicate], indexes: &IndexManager) -> Option<Vec<String>> {
        let mut resolved: Vec<Vec<String>> = children
            .iter()
            .filter_map(|c| self.candidate_ids(c, indexes))
            .collect();
        if resolved.is_empty() {
            return None;
        }
        resolved.sort_by_key(|ids| ids.len());
        let mut acc: std::collections::HashSet<String> = resolved[0].iter().cloned().collect();
        for ids in &resolved[1..] {
            let set: std::collections::HashSet<String> = ids.iter().cloned().collect();
            acc.retain(|id| set.contains(id));
        }
        let mut ids: Vec<String> = acc.into_iter().collect();
        ids.sort();
        Some(ids)
    }

    fn candidate_ids_or(&self, children: &[Predicate], indexes: &IndexManager) -> Option<Vec<String>> {
        let mut union = std::collections::HashSet::new();
        for child in children {
            union.extend(self.candidate_ids(child, indexes)?);
        }
        let mut ids: Vec<String> = union.into_iter().collect();
        ids.sort();
        Some(ids)
    }

    fn plan_for(&self, predicate: &Predicate, indexes: &IndexManager, entity_count: usize) -> Plan {
        let scan_cost = entity_count as f64;
        match predicate {
            Predicate::Equals(field, _) if indexes.has_index(field) => {
                seek_plan(indexes, field, entity_count, Strategy::IndexSeek)
            }
            Predicate::GreaterThan(field, _)
            | Predicate::GreaterThanOrEqual(field, _)
            | Predicate::LessThan(field, _)
            | Predicate::LessThanOrEqual(field, _)
            | Predicate::Between(field, _, _)
                if is_ordered(indexes, field) =>
            {
                seek_plan(indexes, field, entity_count, Strategy::IndexRange)
            }
            Predicate::In(field, _) if indexes.has_index(field) => {
                seek_plan(indexes, field, entity_count, Strategy::IndexSeek)
            }
            Predicate::FullText(field, query) if is_fulltext(indexes, field) => {
                fulltext_plan(indexes, field, query.split_whitespace().count().max(1))
            }
            Predicate::FullTextAny(field, terms) if is_fulltext(indexes, field) => {
                fulltext_plan(indexes, field, terms.len().max(1))
            }
            Predicate::FullTextPhrase(field, phrase) if is_fulltext(indexes, field) => {
                fulltext_plan(indexes, field, phrase.split_whitespace().count().max(1))
            }
            Predicate::FullTextPrefix(field, _) if is_fulltext(indexes, field) => {
                fulltext_plan(indexes, field, 1)
            }
            Predicate::And(children) => {
                let mut plans: Vec<Plan> = children
                    .iter()
                    .map(|c| self.plan_for(c, indexes, entity_count))
                    .collect();
                plans.sort_by(|a, b| a.estimated_cost.total_cmp(&b.estimated_cost));
                if plans.iter().any(|p| p.strategy != Strategy::FullScan) {
                    Plan::combinator(Strategy::Intersection, plans)
                } else {
                    Plan::leaf(Strategy::FullScan, None, scan_cost)
                }
            }
            Predicate::Or(children) => {
                let plans: Vec<Plan> = children
                    .iter()
                    .map(|c| self.plan_for(c, indexes, entity_count))
                    .collect();
                if plans.iter().all(|p| p.strategy != Strategy::FullScan) {
                    Plan::combinator(Strategy::Union, plans)
                } else {
                    Plan::leaf(Strategy::FullScan, None, scan_cost)
                }
            }
            Predicate::Not(inner) => {
                let child = self.plan_for(inner, indexes, entity_count);
                Plan::leaf(Strategy::FullScan, child.driving_field, scan_cost)
            }
            _ => Plan::leaf(Strategy::FullScan, None, scan_cost),
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_ids(indexes: &IndexManager, field: &str, intent: IndexIntent) -> Option<Vec<String>> {
    match indexes.dispatch(field, intent).ok()? {
        IndexResult::Ids(ids) => Some(ids),
        IndexResult::Ranked(scored) => Some(scored.into_iter().map(|(id, _)| id).collect()),
        IndexResult::Count(_) | IndexResult::Exists(_) => None,
    }
}

fn is_ordered(indexes: &IndexManager, field: &str) -> bool {
    matches!(indexes.get_kind(field), Some(IndexKind::Ordered))
}

fn is_fulltext(indexes: &IndexManager, field: &str) -> bool {
    matches!(indexes.get_kind(field), Some(IndexKind::FullText))
}

fn seek_plan(indexes: &IndexManager, field: &str, entity_count: usize, strategy: Strategy) -> Plan {
    let match_count = indexes.total_entries(field).unwrap_or(0);
    let cost = (entity_count.max(1) as f64).log2() + match_count as f64;
    Plan::leaf(strategy, Some(field.to_string()), cost)
}

fn fulltext_plan(indexes: &IndexManager, field: &str, term_count: usize) -> Plan {
    let cardinality = indexes.cardinality(field).unwrap_or(0).max(1);
    let total = indexes.total_entries(field).unwrap_or(0);
    let avg_posting_size = total as f64 / cardinality as f64;
    let cost = term_count as f64 + avg_posting_size;
    Plan::leaf(Strategy::FullTextLookup, Some(field.to_string()), cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexKind;
    use crate::value::{Entity, Value};
    use std::collections::BTreeMap;

    fn entity(id: &str, price: i64) -> Entity {
        let mut fields = BTreeMap::new();
        fields.insert("price".to_string(), Value::Int(price));
        Entity::new(id, fields)
    }

    #[test]
    fn equals_prefers_index_seek_when_indexed() {
        let mut indexes = IndexManager::new();
        indexes.create_index("price", IndexKind::Ordered).unwrap();
        indexes.insert(&entity("a", 5));
        let optimizer = Optimizer::new();
        let plan = optimizer.explain(&Predicate::Equals("price".into(), Value::Int(5)), &indexes, 100);
        assert_eq!(plan.strategy, Strategy::IndexSeek);
    }

    #[test]
    fn unindexed_field_falls_back_to_full_scan() {
        let indexes = IndexManager::new();
        let optimizer = Optimizer::new();
        let plan = optimizer.explain(&Predicate::Equals("price".into(), Value::Int(5)), &indexes, 100);
        assert_eq!(plan.strategy, Strategy::FullScan);
        assert_eq!(plan.estimated_cost, 100.0);
    }

    #[test]
    fn and_with_one_indexed_child_drives_via_intersection() {
        let mut indexes = IndexManager::new();
        indexes.create_index("price", IndexKind::Ordered).unwrap();
        indexes.insert(&entity("a", 5));
        indexes.insert(&entity("b", 10));
        let optimizer = Optimizer::new();
        let pred = Predicate::And(vec![
            Predicate::GreaterThan("price".into(), Value::Int(0)),
            Predicate::Equals("unindexed".into(), Value::Int(1)),
        ]);
        let ids = optimizer.candidate_ids(&pred, &indexes);
        let mut ids = ids.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn or_requires_every_child_indexed() {
        let mut indexes = IndexManager::new();
        indexes.create_index("price", IndexKind::Ordered).unwrap();
        let optimizer = Optimizer::new();
        let pred = Predicate::Or(vec![
            Predicate::Equals("price".into(), Value::Int(5)),
            Predicate::Equals("unindexed".into(), Value::Int(1)),
        ]);
        assert!(optimizer.candidate_ids(&pred, &indexes).is_none());
    }
}
