//! Composable predicate algebra evaluated against an [`crate::value::Entity`].
use crate::value::{Entity, Value};

#[derive(Debug, Clone)]
pub enum Predicate {
    Equals(String, Value),
    NotEquals(String, Value),
    GreaterThan(String, Value),
    GreaterThanOrEqual(String, Value),
    LessThan(String, Value),
    LessThanOrEqual(String, Value),
    Between(String, Value, Value),
    In(String, Vec<Value>),
    Contains(String, Value),
    Prefix(String, String),
    FullText(String, String),
    FullTextAny(String, Vec<String>),
    FullTextPhrase(String, String),
    FullTextPrefix(String, String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Fields this predicate (transitively) references, used to decide
    /// selective query-cache invalidation on write.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Predicate::Equals(f, _)
            | Predicate::NotEquals(f, _)
            | Predicate::GreaterThan(f, _)
            | Predicate::GreaterThanOrEqual(f, _)
            | Predicate::LessThan(f, _)
            | Predicate::LessThanOrEqual(f, _)
            | Predicate::Between(f, _, _)
            | Predicate::In(f, _)
            | Predicate::Contains(f, _)
            | Predicate::Prefix(f, _)
            | Predicate::FullText(f, _)
            | Predicate::FullTextAny(f, _)
            | Predicate::FullTextPhrase(f, _)
            | Predicate::FullTextPrefix(f, _) => out.push(f.clone()),
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
            Predicate::Not(inner) => inner.collect_fields(out),
        }
    }

    /// Evaluates the predicate directly against an entity (the full-scan
    /// fallback path, and the residual filter applied after an index-driven
    /// AND picks its cheapest child).
    ///
    /// Cross-variant comparisons (e.g. `GreaterThan("age", String("x"))`
    /// against an integer field) evaluate to "does not match" rather than
    /// erroring, per [`crate::value::Value`]'s ordering note.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Predicate::Equals(field, value) => entity.get(field) == Some(value),
            Predicate::NotEquals(field, value) => entity.get(field) != Some(value),
            Predicate::GreaterThan(field, value) => {
                same_variant_cmp(entity.get(field), value, |a, b| a > b)
            }
            Predicate::GreaterThanOrEqual(field, value) => {
                same_variant_cmp(entity.get(field), value, |a, b| a >= b)
            }
            Predicate::LessThan(field, value) => {
                same_variant_cmp(entity.get(field), value, |a, b| a < b)
            }
            Predicate::LessThanOrEqual(field, value) => {
                same_variant_cmp(entity.get(field), value, |a, b| a <= b)
            }
            Predicate::Between(field, lo, hi) => match entity.get(field) {
                Some(v) => same_variant(v, lo) && same_variant(v, hi) && v >= lo && v <= hi,
                None => false,
            },
            Predicate::In(field, values) => match entity.get(field) {
                Some(v) => values.iter().any(|candidate| candidate == v),
                None => false,
            },
            Predicate::Contains(field, needle) => match entity.get(field) {
                Some(Value::String(s)) => match needle {
                    Value::String(n) => s.contains(n.as_str()),
                    _ => false,
                },
                Some(Value::List(items)) => items.contains(needle),
                _ => false,
            },
            Predicate::Prefix(field, prefix) => match entity.get(field) {
                Some(Value::String(s)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Predicate::FullText(field, query) => match entity.get(field) {
                Some(Value::String(s)) => {
                    s.to_lowercase().contains(&query.to_lowercase())
                }
                _ => false,
            },
            Predicate::FullTextAny(field, terms) => match entity.get(field) {
                Some(Value::String(s)) => {
                    let lower = s.to_lowercase();
                    terms.iter().any(|t| lower.contains(&t.to_lowercase()))
                }
                _ => false,
            },
            Predicate::FullTextPhrase(field, phrase) => match entity.get(field) {
                Some(Value::String(s)) => s.to_lowercase().contains(&phrase.to_lowercase()),
                _ => false,
            },
            Predicate::FullTextPrefix(field, prefix) => match entity.get(field) {
                Some(Value::String(s)) => s
                    .to_lowercase()
                    .split_whitespace()
                    .any(|token| token.starts_with(&prefix.to_lowercase())),
                _ => false,
            },
            Predicate::And(children) => children.iter().all(|c| c.matches(entity)),
            Predicate::Or(children) => children.iter().any(|c| c.matches(entity)),
            Predicate::Not(inner) => !inner.matches(entity),
        }
    }
}

fn same_variant(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn same_variant_cmp(value: Option<&Value>, target: &Value, op: impl Fn(&Value, &Value) -> bool) -> bool {
    match value {
        Some(v) if same_variant(v, target) => op(v, target),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entity() -> Entity {
        let mut fields = BTreeMap::new();
        fields.insert("age".to_string(), Value::Int(30));
        fields.insert("name".to_string(), Value::String("Ada".to_string()));
        Entity::new("1", fields)
    }

    #[test]
    fn equals_matches_exact_value() {
        assert!(Predicate::Equals("age".into(), Value::Int(30)).matches(&entity()));
        assert!(!Predicate::Equals("age".into(), Value::Int(31)).matches(&entity()));
    }

    #[test]
    fn cross_variant_comparison_never_matches() {
        let pred = Predicate::GreaterThan("age".into(), Value::String("x".into()));
        assert!(!pred.matches(&entity()));
    }

    #[test]
    fn and_or_not_compose() {
        let e = entity();
        let pred = Predicate::And(vec![
            Predicate::GreaterThan("age".into(), Value::Int(20)),
            Predicate::Not(Box::new(Predicate::Equals("name".into(), Value::String("Bob".into())))),
        ]);
        assert!(pred.matches(&e));
    }

    #[test]
    fn missing_field_never_matches() {
        let pred = Predicate::Equals("missing".into(), Value::Int(1));
        assert!(!pred.matches(&entity()));
    }

    #[test]
    fn referenced_fields_collects_nested() {
        let pred = Predicate::And(vec![
            Predicate::Equals("age".into(), Value::Int(1)),
            Predicate::Or(vec![Predicate::Prefix("name".into(), "A".into())]),
        ]);
        let mut fields = pred.referenced_fields();
        fields.sort();
        assert_eq!(fields, vec!["age", "name"]);
    }
}
