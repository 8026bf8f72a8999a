//! Dynamically-typed entity values.
//!
//! Every field stored in a [`crate::collection::Collection`] is a [`Value`] drawn
//! from a closed set of variants. The set is deliberately small: it is the
//! intersection of what the paged storage format, the index subsystem, and the
//! snapshot/JSON codec can all represent without lossy conversions.
//!
//! # See Also
//! - [`Entity`]: the id + field map that [`Value`]s live inside.
//! - [`crate::index`]: indexes order and hash [`Value`]s.

use std::collections::BTreeMap;
use std::fmt;

/// An opaque record stored in a collection.
///
/// Entities are immutable in transit: mutation is always replace-by-id via
/// [`crate::collection::Collection::update`].
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Entity {
    pub id: String,
    pub fields: BTreeMap<String, Value>,
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

impl Entity {
    pub fn encode(&self) -> Vec<u8> {
        bincode::encode_to_vec(self, bincode_config()).expect("entity encoding never fails")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(bytes, bincode_config()).map(|(entity, _)| entity)
    }

    pub fn new(id: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// An entity with no id assigned yet; [`crate::collection::Collection::insert`]
    /// fills one in before it is persisted.
    pub fn unassigned(fields: BTreeMap<String, Value>) -> Self {
        Self {
            id: String::new(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// A single field value.
///
/// # Ordering
///
/// [`Value`] implements a total order so it can serve as a `BTreeMap` key inside
/// [`crate::index::ordered::OrderedIndex`]. Variants are ranked
/// `Null < Bool < Int < Float < Timestamp < String < Blob < List < Map`; within a
/// variant, values compare the natural way (floats via [`f64::total_cmp`] so that
/// `NaN` sorts consistently instead of breaking transitivity).
///
/// This ranking exists purely to make the index's backing map well-ordered. It is
/// *not* used by predicate evaluation: comparing values of different variants in a
/// predicate (e.g. `GreaterThan("age", String("x"))`) always evaluates to "does not
/// match" rather than falling back on the rank (see [`crate::query::predicate`]).
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// UTC timestamp, milliseconds since the Unix epoch.
    Timestamp(i64),
    String(String),
    Blob(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Rank used to order distinct variants against each other.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Timestamp(_) => 4,
            Value::String(_) => 5,
            Value::Blob(_) => 6,
            Value::List(_) => 7,
            Value::Map(_) => 8,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Same-variant comparison used by [`Ord`]. Returns `None` across variants;
    /// callers that need a total order fall back to [`Value::rank`].
    fn cmp_same_variant(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => Some(a.cmp(b)),
            (Value::Map(a), Value::Map(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cmp_same_variant(other)
            .unwrap_or_else(|| self.rank().cmp(&other.rank()))
    }
}

/// Monotonic bit-pattern key matching the ordering `f64::total_cmp` imposes,
/// so that [`Value`]'s `Hash` impl agrees with its `total_cmp`-based `Eq`.
fn float_sort_key(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => float_sort_key(*f).hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::String(s) => s.hash(state),
            Value::Blob(b) => b.hash(state),
            Value::List(items) => items.hash(state),
            Value::Map(m) => {
                for (k, v) in m {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Timestamp(ts) => write!(f, "ts({ts})"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Blob(b) => write!(f, "blob({} bytes)", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(_) => write!(f, "{{..}}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_within_variant() {
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::Float(1.5) < Value::Float(2.5));
        assert!(Value::String("a".into()) < Value::String("b".into()));
    }

    #[test]
    fn orders_across_variants_by_rank() {
        assert!(Value::Null < Value::Bool(false));
        assert!(Value::Int(1_000_000) < Value::String("a".into()));
    }

    #[test]
    fn nan_is_self_consistent() {
        let a = Value::Float(f64::NAN);
        let b = Value::Float(f64::NAN);
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }
}
