//! Predicate algebra, cost-based planning, and a query-result cache sitting
//! above the storage and index subsystems.
//!
//! `cryo` has a `Statement`/`Command` frontend but no cost model at all — it
//! always full-scans — so the optimizer here is designed straight from the
//! plan shapes and tie-break rules rather than adapted from teacher code.
pub mod cache;
pub mod optimizer;
pub mod plan;
pub mod predicate;

use thiserror::Error;

pub use cache::QueryCache;
pub use optimizer::Optimizer;
pub use plan::{Plan, Strategy};
pub use predicate::Predicate;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("index error: {0}")]
    Index(#[from] crate::index::IndexError),
    #[error("field '{0}' referenced by predicate has no comparable index and no stored value")]
    FieldUnavailable(String),
}
