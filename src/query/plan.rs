//! Query execution plans chosen by [`super::optimizer::Optimizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    IndexSeek,
    IndexRange,
    FullTextLookup,
    FullScan,
    Intersection,
    Union,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub strategy: Strategy,
    pub driving_field: Option<String>,
    pub estimated_cost: f64,
    pub children: Vec<Plan>,
}

impl Plan {
    pub fn leaf(strategy: Strategy, driving_field: Option<String>, estimated_cost: f64) -> Self {
        Self {
            strategy,
            driving_field,
            estimated_cost,
            children: Vec::new(),
        }
    }

    pub fn combinator(strategy: Strategy, children: Vec<Plan>) -> Self {
        let estimated_cost = children.iter().map(|c| c.estimated_cost).sum();
        Self {
            strategy,
            driving_field: None,
            estimated_cost,
            children,
        }
    }
}
