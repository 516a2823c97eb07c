use thiserror::Error;

use crate::budget::approx_dp::ApproxDPBudget;

/// Reasons a single `(epsilon, delta)` pair is not a legal budget.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShapeError {
    #[error("epsilon and delta must be numbers")]
    NotANumber,

    #[error("epsilon must be non-negative, got {0}")]
    NegativeEpsilon(f64),

    #[error("delta must be in [0, 1], got {0}")]
    DeltaOutOfRange(f64),

    #[error("epsilon and delta cannot both be zero")]
    ZeroBudget,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger could not be constructed from the given parameters.
    #[error("invalid ledger configuration: {0}")]
    InvalidConfig(String),

    /// A requested spend is not a legal budget. Nothing was accounted.
    #[error("invalid privacy budget: {0}")]
    InvalidBudget(#[from] ShapeError),

    #[error("number of queries must be at least 1, got {0}")]
    InvalidQueryCount(usize),

    /// Consuming `requested` would compose to `composed`, which does not fit
    /// within `capacity`. The ledger is left unchanged.
    #[error(
        "privacy budget exceeded: spending {requested} would bring the total \
         to {composed}, but the capacity is {capacity}"
    )]
    BudgetExceeded {
        requested: ApproxDPBudget,
        composed: ApproxDPBudget,
        capacity: ApproxDPBudget,
    },

    #[error("changing slack to {slack} would exceed the privacy budget")]
    SlackExceedsBudget { slack: f64 },

    #[error("no default ledger is set")]
    EmptyRegistry,

    #[error("ledger lock poisoned by a panicking thread")]
    Poisoned,
}

impl LedgerError {
    /// Whether this error means "out of budget" rather than a malformed call.
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, LedgerError::BudgetExceeded { .. })
    }
}
