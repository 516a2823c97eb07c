use std::fmt;

use log::debug;
use serde::Serialize;

use super::{
    approx_dp::ApproxDPBudget,
    composition::Composition,
    registry::SharedLedger,
    traits::{Filter, FilterStatus},
};
use crate::errors::LedgerError;

/// Number of spent entries shown by `Display` before eliding the rest.
const DISPLAYED_SPENDS: usize = 5;

/// Tracks the privacy budget spent against a fixed (epsilon, delta) capacity.
///
/// Spends are composed with
/// [`composed_total`](super::composition::composed_total): sequentially when
/// `slack` is zero, with the advanced composition bound otherwise. The ledger
/// is exhausted whenever no further positive spend fits; this is recomputed
/// on each call rather than stored.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetLedger {
    /// Total budget. When epsilon is infinite, delta is 1.
    capacity: ApproxDPBudget,

    /// Part of the delta capacity reserved for the composition bound.
    slack: f64,

    /// Spends in chronological order. Append-only.
    spent: Vec<ApproxDPBudget>,

    /// `spent`, folded. Updated together with it.
    #[serde(skip)]
    composition: Composition,
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl BudgetLedger {
    /// A ledger that admits every well-formed spend.
    pub fn unbounded() -> Self {
        Self {
            capacity: ApproxDPBudget::UNBOUNDED,
            slack: 0.0,
            spent: vec![],
            composition: Composition::default(),
        }
    }

    pub fn new(epsilon: f64, delta: f64) -> Result<Self, LedgerError> {
        Self::from_parts(epsilon, delta, 0.0, &[])
    }

    pub fn with_slack(
        epsilon: f64,
        delta: f64,
        slack: f64,
    ) -> Result<Self, LedgerError> {
        Self::from_parts(epsilon, delta, slack, &[])
    }

    /// Builds a ledger with capacity `(epsilon, delta)`, reserving `slack` of
    /// the delta capacity for advanced composition, and replays
    /// `spent_budget` as if each entry had been spent in order.
    pub fn from_parts(
        epsilon: f64,
        delta: f64,
        slack: f64,
        spent_budget: &[(f64, f64)],
    ) -> Result<Self, LedgerError> {
        ApproxDPBudget::validate(epsilon, delta).map_err(|err| {
            LedgerError::InvalidConfig(format!("total budget: {err}"))
        })?;
        if !(0.0..=delta).contains(&slack) {
            return Err(LedgerError::InvalidConfig(format!(
                "slack must be in [0, {delta}], got {slack}"
            )));
        }

        let capacity = if epsilon == f64::INFINITY {
            ApproxDPBudget::UNBOUNDED
        } else {
            ApproxDPBudget::new(epsilon, delta)
        };

        let mut ledger = Self {
            capacity,
            slack,
            spent: Vec::with_capacity(spent_budget.len()),
            composition: Composition::default(),
        };
        for (index, &(epsilon, delta)) in spent_budget.iter().enumerate() {
            let entry = ApproxDPBudget::try_new(epsilon, delta).map_err(|err| {
                LedgerError::InvalidConfig(format!(
                    "spent budget entry {index}: {err}"
                ))
            })?;
            ledger.spend_request(entry)?;
        }

        Ok(ledger)
    }

    /// Checks that spending `(epsilon, delta)` is well-formed and stays within
    /// the capacity. Never modifies the ledger.
    pub fn check(&self, epsilon: f64, delta: f64) -> Result<(), LedgerError> {
        self.check_request(&ApproxDPBudget::new(epsilon, delta))
    }

    pub fn check_request(
        &self,
        requested: &ApproxDPBudget,
    ) -> Result<(), LedgerError> {
        ApproxDPBudget::validate(requested.epsilon.value(), requested.delta)?;

        // Unbounded ledgers accept every request, even infinite ones.
        if self.capacity.epsilon.is_infinite() {
            return Ok(());
        }

        let composed = self.composition.with(requested).total(self.slack);

        if composed.fits_within(&self.capacity) {
            Ok(())
        } else {
            debug!(
                "Rejecting {requested}: composed total {composed} exceeds {}",
                self.capacity
            );
            Err(LedgerError::BudgetExceeded {
                requested: *requested,
                composed,
                capacity: self.capacity,
            })
        }
    }

    /// Records a spend of `(epsilon, delta)` if [`Self::check`] accepts it.
    /// On error the ledger is unchanged.
    pub fn spend(
        &mut self,
        epsilon: f64,
        delta: f64,
    ) -> Result<&mut Self, LedgerError> {
        self.spend_request(ApproxDPBudget::new(epsilon, delta))
    }

    pub fn spend_request(
        &mut self,
        requested: ApproxDPBudget,
    ) -> Result<&mut Self, LedgerError> {
        self.check_request(&requested)?;
        self.spent.push(requested);
        self.composition = self.composition.with(&requested);
        debug!("Spent {requested}, total is now {}", self.total());
        Ok(self)
    }

    /// Sequential composition of everything spent so far.
    pub fn total(&self) -> ApproxDPBudget {
        self.composition.basic()
    }

    /// Composition of everything spent so far under the ledger's slack. This
    /// is the figure compared against the capacity.
    pub fn composed_total(&self) -> ApproxDPBudget {
        self.composition.total(self.slack)
    }

    /// Largest budget each of `k` further identical queries may spend.
    pub fn remaining(&self, k: usize) -> Result<ApproxDPBudget, LedgerError> {
        self.composition.remaining(&self.capacity, self.slack, k)
    }

    /// Changes the slack, as long as the spends so far still fit.
    pub fn set_slack(&mut self, slack: f64) -> Result<(), LedgerError> {
        if !(0.0..=self.capacity.delta).contains(&slack) {
            return Err(LedgerError::InvalidConfig(format!(
                "slack must be in [0, {}], got {slack}",
                self.capacity.delta
            )));
        }

        let composed = self.composition.total(slack);
        if !self.capacity.epsilon.is_infinite()
            && !composed.fits_within(&self.capacity)
        {
            return Err(LedgerError::SlackExceedsBudget { slack });
        }

        self.slack = slack;
        Ok(())
    }

    pub fn epsilon(&self) -> f64 {
        self.capacity.epsilon.value()
    }

    pub fn delta(&self) -> f64 {
        self.capacity.delta
    }

    pub fn capacity(&self) -> ApproxDPBudget {
        self.capacity
    }

    pub fn slack(&self) -> f64 {
        self.slack
    }

    pub fn spent_budget(&self) -> &[ApproxDPBudget] {
        &self.spent
    }

    pub fn into_shared(self) -> SharedLedger {
        SharedLedger::new(self)
    }

    /// Shares this ledger and pushes it onto the thread's default stack.
    pub fn set_default(self) -> SharedLedger {
        self.into_shared().set_default()
    }
}

impl fmt::Display for BudgetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params = vec![];
        if !self.capacity.epsilon.is_infinite() {
            params.push(format!("epsilon={}", self.capacity.epsilon));
        }
        if self.capacity.delta != 1.0 {
            params.push(format!("delta={}", self.capacity.delta));
        }
        if self.slack > 0.0 {
            params.push(format!("slack={}", self.slack));
        }
        if !self.spent.is_empty() {
            let mut entries: Vec<String> = self
                .spent
                .iter()
                .take(DISPLAYED_SPENDS)
                .map(ToString::to_string)
                .collect();
            if self.spent.len() > DISPLAYED_SPENDS {
                entries.push("...".to_string());
            }
            params.push(format!("spent_budget=[{}]", entries.join(", ")));
        }

        write!(f, "BudgetLedger({})", params.join(", "))
    }
}

impl Filter<ApproxDPBudget> for BudgetLedger {
    type Error = LedgerError;

    fn new(capacity: ApproxDPBudget) -> Result<Self, Self::Error> {
        Self::from_parts(capacity.epsilon.value(), capacity.delta, 0.0, &[])
    }

    fn can_consume(
        &self,
        budget: &ApproxDPBudget,
    ) -> Result<FilterStatus, Self::Error> {
        filter_status(self.check_request(budget))
    }

    fn try_consume(
        &mut self,
        budget: &ApproxDPBudget,
    ) -> Result<FilterStatus, Self::Error> {
        filter_status(self.spend_request(*budget).map(|_| ()))
    }

    fn remaining_budget(&self) -> Result<ApproxDPBudget, Self::Error> {
        self.remaining(1)
    }
}

/// Out-of-budget is a filter outcome, not an error.
fn filter_status(
    result: Result<(), LedgerError>,
) -> Result<FilterStatus, LedgerError> {
    match result {
        Ok(()) => Ok(FilterStatus::Continue),
        Err(err) if err.is_budget_exceeded() => Ok(FilterStatus::OutOfBudget),
        Err(err) => Err(err),
    }
}
