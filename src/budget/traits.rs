use std::fmt::Debug;

/// Trait for privacy budgets
pub trait Budget: Clone + Debug {
    // For now just a marker trait requiring Clone
}

/// Trait for a privacy filter.
///
/// Mechanisms that only need to admit or reject a cost are written against
/// this trait rather than against a concrete ledger.
pub trait Filter<B: Budget> {
    type Error;

    /// Initializes a new filter with a given capacity.
    fn new(capacity: B) -> Result<Self, Self::Error>
    where
        Self: Sized;

    /// Checks if the filter has enough budget without consuming
    fn can_consume(&self, budget: &B) -> Result<FilterStatus, Self::Error>;

    /// Tries to consume a given budget from the filter.
    /// In the formalism from https://arxiv.org/abs/1605.08294,
    /// Continue corresponds to CONTINUE, and OutOfBudget corresponds to HALT.
    /// A filter that halts must not record any consumption.
    fn try_consume(&mut self, budget: &B) -> Result<FilterStatus, Self::Error>;

    /// Gets the largest budget a single further request may consume.
    fn remaining_budget(&self) -> Result<B, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    OutOfBudget,
}
