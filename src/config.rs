use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{budget::ledger::BudgetLedger, errors::LedgerError};

/// Serializable description of a ledger.
///
/// A missing `epsilon` means an unbounded ledger and a missing `delta` means
/// a delta capacity of 1. Each `spent_budget` entry is an `[epsilon, delta]`
/// pair, replayed in order when the ledger is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default)]
    pub epsilon: Option<f64>,

    #[serde(default)]
    pub delta: Option<f64>,

    #[serde(default)]
    pub slack: f64,

    #[serde(default)]
    pub spent_budget: Vec<Vec<f64>>,
}

impl LedgerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .context("Failed to parse ledger configuration")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).with_context(|| {
            format!("Failed to read ledger configuration {}", path.display())
        })?;
        Self::from_json_str(&contents).with_context(|| {
            format!("Invalid configuration in {}", path.display())
        })
    }

    /// The spent history as pairs. Entries that are not exactly
    /// `[epsilon, delta]` are rejected.
    pub fn spent_pairs(&self) -> Result<Vec<(f64, f64)>, LedgerError> {
        self.spent_budget
            .iter()
            .enumerate()
            .map(|(index, entry)| match entry.as_slice() {
                [epsilon, delta] => Ok((*epsilon, *delta)),
                _ => Err(LedgerError::InvalidConfig(format!(
                    "spent budget entry {index} must be an [epsilon, delta] \
                     pair, got {} values",
                    entry.len()
                ))),
            })
            .collect()
    }

    pub fn build(&self) -> Result<BudgetLedger, LedgerError> {
        let spent = self.spent_pairs()?;
        BudgetLedger::from_parts(
            self.epsilon.unwrap_or(f64::INFINITY),
            self.delta.unwrap_or(1.0),
            self.slack,
            &spent,
        )
    }
}

impl TryFrom<LedgerConfig> for BudgetLedger {
    type Error = LedgerError;

    fn try_from(config: LedgerConfig) -> Result<Self, Self::Error> {
        config.build()
    }
}

/// Reads a JSON ledger configuration and builds the ledger it describes.
pub fn load_ledger(path: impl AsRef<Path>) -> Result<BudgetLedger> {
    let config = LedgerConfig::from_file(path)?;
    let ledger = config.build()?;
    log::info!("Loaded ledger {ledger}");
    Ok(ledger)
}
