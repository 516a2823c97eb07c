use std::{fmt, ops::Add};

use serde::Serialize;

pub use crate::budget::traits::{Budget, Filter, FilterStatus};
use crate::errors::ShapeError;

/// Privacy loss parameter. `Infinite` is an unbounded budget (or an unbounded
/// spend), distinct from any finite value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub enum Epsilon {
    Finite(f64),
    Infinite,
}

impl Epsilon {
    pub fn value(&self) -> f64 {
        match self {
            Epsilon::Finite(epsilon) => *epsilon,
            Epsilon::Infinite => f64::INFINITY,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Epsilon::Infinite)
    }
}

impl From<f64> for Epsilon {
    fn from(value: f64) -> Self {
        if value == f64::INFINITY {
            Epsilon::Infinite
        } else {
            Epsilon::Finite(value)
        }
    }
}

impl Add for Epsilon {
    type Output = Epsilon;

    fn add(self, other: Epsilon) -> Epsilon {
        match (self, other) {
            (Epsilon::Finite(a), Epsilon::Finite(b)) => Epsilon::from(a + b),
            _ => Epsilon::Infinite,
        }
    }
}

impl fmt::Display for Epsilon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Epsilon::Finite(epsilon) => write!(f, "{epsilon}"),
            Epsilon::Infinite => write!(f, "inf"),
        }
    }
}

/// An (epsilon, delta)-DP budget: either a capacity or an amount spent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ApproxDPBudget {
    pub epsilon: Epsilon,
    pub delta: f64,
}

impl Budget for ApproxDPBudget {}

impl ApproxDPBudget {
    /// A budget that admits everything. Delta is 1 by convention.
    pub const UNBOUNDED: Self = Self {
        epsilon: Epsilon::Infinite,
        delta: 1.0,
    };

    pub const ZERO: Self = Self {
        epsilon: Epsilon::Finite(0.0),
        delta: 0.0,
    };

    /// Builds a budget without validation.
    pub fn new(epsilon: impl Into<Epsilon>, delta: f64) -> Self {
        Self {
            epsilon: epsilon.into(),
            delta,
        }
    }

    /// Builds a budget after checking that it is a legal spend or capacity.
    pub fn try_new(epsilon: f64, delta: f64) -> Result<Self, ShapeError> {
        Self::validate(epsilon, delta)?;
        Ok(Self::new(epsilon, delta))
    }

    /// Checks `epsilon >= 0`, `0 <= delta <= 1` and that the pair is not
    /// `(0, 0)`.
    pub fn validate(epsilon: f64, delta: f64) -> Result<(), ShapeError> {
        if epsilon.is_nan() || delta.is_nan() {
            return Err(ShapeError::NotANumber);
        }
        if epsilon < 0.0 {
            return Err(ShapeError::NegativeEpsilon(epsilon));
        }
        if !(0.0..=1.0).contains(&delta) {
            return Err(ShapeError::DeltaOutOfRange(delta));
        }
        if epsilon == 0.0 && delta == 0.0 {
            return Err(ShapeError::ZeroBudget);
        }
        Ok(())
    }

    /// Whether this budget fits within `capacity`, component-wise and without
    /// any margin. An infinite capacity epsilon admits any epsilon.
    pub fn fits_within(&self, capacity: &ApproxDPBudget) -> bool {
        let epsilon_fits = match (self.epsilon, capacity.epsilon) {
            (_, Epsilon::Infinite) => true,
            (Epsilon::Infinite, Epsilon::Finite(_)) => false,
            (Epsilon::Finite(spent), Epsilon::Finite(limit)) => {
                spent <= limit
            }
        };
        epsilon_fits && self.delta <= capacity.delta
    }
}

impl From<(f64, f64)> for ApproxDPBudget {
    fn from((epsilon, delta): (f64, f64)) -> Self {
        Self::new(epsilon, delta)
    }
}

impl fmt::Display for ApproxDPBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.epsilon, self.delta)
    }
}
