//! Composition of (epsilon, delta) spends.
//!
//! Without slack, spends compose sequentially: epsilons and deltas add up.
//! With a slack `s > 0`, part of the delta budget pays for a sub-linear
//! epsilon bound, following the relaxations of the optimal composition
//! theorem in Kairouz, Oh and Viswanath (https://arxiv.org/abs/1311.0776,
//! Theorem 3.5):
//!
//! ```text
//! eps = min( sum(e_i),
//!            sum(e_i * tanh(e_i / 2)) + sqrt(2 * sum(e_i^2) * ln(1 / s)),
//!            sum(e_i * tanh(e_i / 2))
//!                + sqrt(2 * sum(e_i^2) * ln(e + sqrt(sum(e_i^2)) / s)) )
//! delta = sum(d_i) + s
//! ```
//!
//! Every term is non-decreasing in each `e_i`, so the composed epsilon can be
//! inverted by bisection.

use log::trace;

use super::approx_dp::{ApproxDPBudget, Epsilon};
use crate::errors::LedgerError;

/// Halvings needed to walk the bisection interval from `f64::MAX` down to the
/// smallest subnormal.
pub const MAX_BISECTION_STEPS: usize = 2200;

/// Sequential composition: sums epsilons and deltas. Any infinite epsilon
/// saturates the result to `(inf, 1)`.
pub fn basic_total(items: &[ApproxDPBudget]) -> ApproxDPBudget {
    Composition::from_items(items).basic()
}

/// Composition under `slack`. Falls back to [`basic_total`] when `slack` is
/// zero; otherwise charges `slack` to delta and takes the tightest of the
/// epsilon bounds.
pub fn composed_total(items: &[ApproxDPBudget], slack: f64) -> ApproxDPBudget {
    Composition::from_items(items).total(slack)
}

/// Largest per-query budget such that `k` more queries of that cost, composed
/// with `spent` under `slack`, still fit within `total`.
pub fn advanced_remaining(
    total: &ApproxDPBudget,
    slack: f64,
    spent: &[ApproxDPBudget],
    k: usize,
) -> Result<ApproxDPBudget, LedgerError> {
    Composition::from_items(spent).remaining(total, slack, k)
}

/// Running sums a composed total is computed from.
///
/// Spends are folded in one at a time, in order, so two compositions built
/// from the same history hold bit-identical sums. A ledger keeps one up to
/// date instead of recomposing its whole history on every check.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Composition {
    /// Set once an infinite epsilon has been folded in.
    unbounded: bool,
    sum: f64,
    tanh_sum: f64,
    square_sum: f64,
    delta_sum: f64,
}

impl Composition {
    pub fn from_items(items: &[ApproxDPBudget]) -> Self {
        items.iter().fold(Self::default(), |composition, item| {
            composition.with(item)
        })
    }

    /// This composition followed by one more spend.
    pub fn with(self, item: &ApproxDPBudget) -> Self {
        let epsilon = match item.epsilon {
            Epsilon::Infinite => {
                return Self {
                    unbounded: true,
                    ..self
                }
            }
            Epsilon::Finite(epsilon) => epsilon,
        };

        Self {
            unbounded: self.unbounded,
            sum: self.sum + epsilon,
            tanh_sum: self.tanh_sum + epsilon * (epsilon / 2.0).tanh(),
            square_sum: self.square_sum + epsilon * epsilon,
            delta_sum: self.delta_sum + item.delta,
        }
    }

    /// Folds `item` in `count` times, exactly as `count` spends would.
    fn with_sequence(self, item: &ApproxDPBudget, count: usize) -> Self {
        (0..count).fold(self, |composition, _| composition.with(item))
    }

    /// Closed form of `count` identical finite epsilons. Cheaper than
    /// [`Self::with_sequence`] but may differ from it in the last bits.
    fn with_repeated_epsilon(self, epsilon: f64, count: usize) -> Self {
        let count = count as f64;
        Self {
            sum: self.sum + count * epsilon,
            tanh_sum: self.tanh_sum + count * epsilon * (epsilon / 2.0).tanh(),
            square_sum: self.square_sum + count * epsilon * epsilon,
            ..self
        }
    }

    /// See [`basic_total`].
    pub fn basic(&self) -> ApproxDPBudget {
        if self.unbounded {
            return ApproxDPBudget::UNBOUNDED;
        }
        ApproxDPBudget::new(self.sum, self.delta_sum)
    }

    /// See [`composed_total`].
    pub fn total(&self, slack: f64) -> ApproxDPBudget {
        if slack == 0.0 || self.unbounded {
            return self.basic();
        }
        ApproxDPBudget::new(self.epsilon_bound(slack), self.delta_sum + slack)
    }

    /// See [`advanced_remaining`].
    pub fn remaining(
        &self,
        total: &ApproxDPBudget,
        slack: f64,
        k: usize,
    ) -> Result<ApproxDPBudget, LedgerError> {
        if k == 0 {
            return Err(LedgerError::InvalidQueryCount(k));
        }

        let capacity = match total.epsilon {
            Epsilon::Infinite => {
                return Ok(ApproxDPBudget::new(Epsilon::Infinite, total.delta))
            }
            Epsilon::Finite(capacity) => capacity,
        };
        if self.unbounded {
            return Ok(ApproxDPBudget::ZERO);
        }

        let spent_total = self.total(slack);
        let delta = ((total.delta - spent_total.delta) / k as f64).max(0.0);
        let epsilon = bisect_feasible(capacity, |epsilon| {
            self.with_repeated_epsilon(epsilon, k).epsilon_bound(slack)
                <= capacity
        });

        // The k spends are checked one at a time, which rounds differently
        // from the closed form. Back off until the sequence itself fits.
        let epsilon = back_off_until(epsilon, |epsilon| {
            let item = ApproxDPBudget::new(epsilon, 0.0);
            self.with_sequence(&item, k).total(slack).epsilon.value()
                <= capacity
        });
        let delta = back_off_until(delta, |delta| {
            let item = ApproxDPBudget::new(0.0, delta);
            self.with_sequence(&item, k).total(slack).delta <= total.delta
        });

        Ok(ApproxDPBudget::new(epsilon, delta))
    }

    fn epsilon_bound(&self, slack: f64) -> f64 {
        if slack == 0.0 {
            return self.sum;
        }

        let direct = self.tanh_sum
            + (2.0 * self.square_sum * (1.0 / slack).ln()).sqrt();
        let refined = self.tanh_sum
            + (2.0
                * self.square_sum
                * (std::f64::consts::E + self.square_sum.sqrt() / slack).ln())
            .sqrt();

        self.sum.min(direct).min(refined)
    }
}

/// Largest `x` in `[0, upper]` with `fits(x)`, assuming `fits` is monotone
/// and `fits(0)` holds. Returns the feasible end of the final interval.
fn bisect_feasible(upper: f64, fits: impl Fn(f64) -> bool) -> f64 {
    if fits(upper) {
        return upper;
    }

    let mut lower = 0.0_f64;
    let mut upper = upper;
    let mut steps = 0;
    while steps < MAX_BISECTION_STEPS {
        let mid = lower + (upper - lower) / 2.0;
        if mid <= lower || mid >= upper {
            break;
        }
        if fits(mid) {
            lower = mid;
        } else {
            upper = mid;
        }
        steps += 1;
    }
    trace!("Bisection converged to {lower} after {steps} steps");

    lower
}

/// Steps a non-negative `value` down until `fits` holds, one ulp at first and
/// doubling the stride after every miss. Gives up at zero.
fn back_off_until(value: f64, fits: impl Fn(f64) -> bool) -> f64 {
    let mut value = value;
    let mut stride = 1_u64;
    while value > 0.0 && !fits(value) {
        let bits = value.to_bits();
        value = if bits > stride {
            f64::from_bits(bits - stride)
        } else {
            0.0
        };
        stride = stride.saturating_mul(2);
    }
    value
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn items(pairs: &[(f64, f64)]) -> Vec<ApproxDPBudget> {
        pairs.iter().copied().map(ApproxDPBudget::from).collect()
    }

    #[test]
    fn test_basic_total() {
        let spent = items(&[(1.0, 0.0), (1.0, 0.5), (5.0, 0.0)]);
        assert_eq!(basic_total(&spent), ApproxDPBudget::new(7.0, 0.5));
        assert_eq!(basic_total(&[]), ApproxDPBudget::new(0.0, 0.0));

        // Deltas are not capped.
        let spent = items(&[(1.0, 0.75), (1.0, 0.75)]);
        assert_eq!(basic_total(&spent), ApproxDPBudget::new(2.0, 1.5));
    }

    #[test]
    fn test_basic_total_saturates() {
        let spent = items(&[(1.0, 0.0), (f64::INFINITY, 0.0), (2.0, 0.1)]);
        assert_eq!(basic_total(&spent), ApproxDPBudget::UNBOUNDED);
    }

    #[test]
    fn test_composed_total_without_slack_is_basic() {
        let spent = items(&[(0.3, 0.0), (0.2, 1e-3)]);
        assert_eq!(composed_total(&spent, 0.0), basic_total(&spent));
    }

    #[test]
    fn test_composed_total_with_slack() {
        // Many small spends compose sub-linearly.
        let spent = vec![ApproxDPBudget::new(0.01, 0.0); 1000];
        let composed = composed_total(&spent, 1e-6);
        assert!(composed.epsilon.value() < 10.0);
        assert_relative_eq!(composed.delta, 1e-6);

        // A single spend never gets worse than the naive bound.
        let spent = items(&[(0.5, 0.0)]);
        assert_relative_eq!(composed_total(&spent, 1e-9).epsilon.value(), 0.5);
    }

    #[test]
    fn test_composed_total_is_monotone() {
        let mut previous = 0.0;
        for step in 1..50 {
            let epsilon = step as f64 * 0.02;
            let spent = vec![ApproxDPBudget::new(epsilon, 0.0); 20];
            let composed = composed_total(&spent, 1e-5).epsilon.value();
            assert!(composed >= previous);
            previous = composed;
        }
    }

    #[test]
    fn test_remaining_basic() -> Result<(), anyhow::Error> {
        let total = ApproxDPBudget::new(1.0, 0.0);

        let remaining = advanced_remaining(&total, 0.0, &[], 1)?;
        assert_eq!(remaining, ApproxDPBudget::new(1.0, 0.0));

        let remaining = advanced_remaining(&total, 0.0, &[], 10)?;
        assert_relative_eq!(remaining.epsilon.value(), 0.1, epsilon = 1e-12);
        assert_eq!(remaining.delta, 0.0);

        let spent = items(&[(0.25, 0.0)]);
        let remaining = advanced_remaining(&total, 0.0, &spent, 3)?;
        assert_relative_eq!(remaining.epsilon.value(), 0.25, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_remaining_infinite_total() -> Result<(), anyhow::Error> {
        let spent = items(&[(f64::INFINITY, 1.0)]);
        for k in [1, 100] {
            let remaining =
                advanced_remaining(&ApproxDPBudget::UNBOUNDED, 0.0, &spent, k)?;
            assert_eq!(remaining, ApproxDPBudget::UNBOUNDED);
        }

        let total = ApproxDPBudget::new(f64::INFINITY, 0.5);
        let remaining = advanced_remaining(&total, 0.0, &[], 7)?;
        assert_eq!(remaining, ApproxDPBudget::new(f64::INFINITY, 0.5));
        Ok(())
    }

    #[test]
    fn test_remaining_slack_equals_delta() -> Result<(), anyhow::Error> {
        let total = ApproxDPBudget::new(1.0, 1e-2);
        let remaining = advanced_remaining(&total, 1e-2, &[], 100)?;
        assert_eq!(remaining.delta, 0.0);
        assert!(remaining.epsilon.value() >= 0.01);
        Ok(())
    }

    #[test]
    fn test_remaining_is_feasible() -> Result<(), anyhow::Error> {
        let total = ApproxDPBudget::new(1.0, 1e-2);
        let slack = 1e-5;
        let spent = items(&[(0.01, 0.0), (0.01, 0.0), (0.01, 0.0)]);
        let k = 50;

        let remaining = advanced_remaining(&total, slack, &spent, k)?;

        let mut candidate = spent.clone();
        candidate.extend(std::iter::repeat(remaining).take(k));
        assert!(composed_total(&candidate, slack).fits_within(&total));

        // Anything smaller is feasible too.
        let smaller = ApproxDPBudget::new(
            remaining.epsilon.value() * 0.5,
            remaining.delta,
        );
        let mut candidate = spent.clone();
        candidate.extend(std::iter::repeat(smaller).take(k));
        assert!(composed_total(&candidate, slack).fits_within(&total));
        Ok(())
    }

    #[test]
    fn test_remaining_fits_when_spent_one_by_one() -> Result<(), anyhow::Error>
    {
        // Neither capacity is a multiple of the per-query share, so the
        // closed form and the one-at-a-time sums round differently.
        let cases = [
            (ApproxDPBudget::new(1e6, 0.5), 0.0, items(&[(0.1, 0.1)]), 7),
            (ApproxDPBudget::new(1.0, 0.3), 0.0, items(&[(0.3, 0.1)]), 3),
            (ApproxDPBudget::new(3.7, 1e-2), 1e-4, items(&[(0.2, 1e-3)]), 33),
        ];
        for (total, slack, spent, k) in cases {
            let remaining = advanced_remaining(&total, slack, &spent, k)?;
            assert!(remaining.epsilon.value() > 0.0);

            let mut candidate = spent.clone();
            for _ in 0..k {
                candidate.push(remaining);
                assert!(
                    composed_total(&candidate, slack).fits_within(&total),
                    "{remaining} x {} overshoots {total}",
                    candidate.len() - spent.len()
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_incremental_composition_matches_history() {
        let spent = items(&[(0.1, 1e-3), (0.7, 0.0), (0.05, 2e-4), (1.3, 0.0)]);
        let incremental = spent
            .iter()
            .fold(Composition::default(), |composition, item| {
                composition.with(item)
            });
        assert_eq!(incremental, Composition::from_items(&spent));
        for slack in [0.0, 1e-6] {
            assert_eq!(incremental.total(slack), composed_total(&spent, slack));
        }

        let saturated = incremental.with(&ApproxDPBudget::UNBOUNDED);
        assert!(saturated.unbounded);
        assert_eq!(saturated.total(1e-6), ApproxDPBudget::UNBOUNDED);
    }

    #[test]
    fn test_back_off_until() {
        assert_eq!(back_off_until(1.0, |x| x <= 1.0), 1.0);

        let found = back_off_until(0.3, |x| x < 0.3);
        assert!(found < 0.3);
        assert_relative_eq!(found, 0.3, epsilon = 1e-15);

        assert_eq!(back_off_until(5.0, |x| x == 0.0), 0.0);
    }

    #[test]
    fn test_remaining_rejects_zero_queries() {
        let total = ApproxDPBudget::new(1.0, 1e-2);
        let result = advanced_remaining(&total, 1e-3, &[], 0);
        assert!(matches!(result, Err(LedgerError::InvalidQueryCount(0))));
    }

    #[test]
    fn test_bisection_terminates_on_exhausted_budget() {
        // Nothing but zero fits: the interval collapses onto 0.
        let found = bisect_feasible(1.0, |x| x == 0.0);
        assert_eq!(found, 0.0);

        let found = bisect_feasible(f64::MAX, |x| x <= 3.0);
        assert_relative_eq!(found, 3.0);
    }
}
