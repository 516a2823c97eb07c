//! Ambient default ledgers.
//!
//! Mechanisms that are not handed a ledger explicitly fall back to the
//! default one: the top of a per-thread stack of shared ledgers. The stack
//! only holds `Arc` clones, so whoever created a ledger keeps access to it
//! after it is popped.

use std::{
    cell::RefCell,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, warn};

use super::{approx_dp::ApproxDPBudget, ledger::BudgetLedger};
use crate::errors::LedgerError;

thread_local! {
    static DEFAULT_LEDGERS: RefCell<Vec<SharedLedger>> =
        const { RefCell::new(Vec::new()) };
}

/// A ledger that can be shared between call sites and threads. Every
/// operation holds the lock for its whole duration, so concurrent spenders
/// cannot both pass the check and jointly overshoot the capacity.
#[derive(Debug, Clone)]
pub struct SharedLedger {
    inner: Arc<Mutex<BudgetLedger>>,
}

impl SharedLedger {
    pub fn new(ledger: BudgetLedger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, BudgetLedger>, LedgerError> {
        self.inner.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Whether both handles refer to the same ledger.
    pub fn ptr_eq(&self, other: &SharedLedger) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn check(&self, epsilon: f64, delta: f64) -> Result<(), LedgerError> {
        self.lock()?.check(epsilon, delta)
    }

    pub fn spend(
        &self,
        epsilon: f64,
        delta: f64,
    ) -> Result<&Self, LedgerError> {
        self.lock()?.spend(epsilon, delta)?;
        Ok(self)
    }

    pub fn total(&self) -> Result<ApproxDPBudget, LedgerError> {
        Ok(self.lock()?.total())
    }

    pub fn remaining(&self, k: usize) -> Result<ApproxDPBudget, LedgerError> {
        self.lock()?.remaining(k)
    }

    /// Pushes this ledger onto the thread's default stack.
    pub fn set_default(&self) -> SharedLedger {
        set_default(self)
    }

    /// Makes this ledger the default until the returned guard is dropped.
    pub fn scoped_default(&self) -> DefaultLedgerGuard {
        set_default(self);
        DefaultLedgerGuard {
            ledger: self.clone(),
        }
    }
}

pub fn set_default(ledger: &SharedLedger) -> SharedLedger {
    DEFAULT_LEDGERS.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(ledger.clone());
        debug!("Pushed default ledger, {} on the stack", stack.len());
    });
    ledger.clone()
}

/// Removes and returns the current default ledger.
pub fn pop_default() -> Result<SharedLedger, LedgerError> {
    DEFAULT_LEDGERS
        .with(|stack| stack.borrow_mut().pop())
        .ok_or(LedgerError::EmptyRegistry)
}

pub fn peek_default() -> Option<SharedLedger> {
    DEFAULT_LEDGERS.with(|stack| stack.borrow().last().cloned())
}

/// Returns `ledger` if given, otherwise the current default. When no default
/// is set, an unbounded ledger is created and becomes the default.
pub fn load_default(ledger: Option<SharedLedger>) -> SharedLedger {
    if let Some(ledger) = ledger {
        return ledger;
    }

    DEFAULT_LEDGERS.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(top) = stack.last() {
            return top.clone();
        }
        debug!("No default ledger set, creating an unbounded one");
        let ledger = BudgetLedger::unbounded().into_shared();
        stack.push(ledger.clone());
        ledger
    })
}

/// Keeps a ledger on the default stack for as long as it lives.
#[must_use = "the default ledger is removed again when the guard is dropped"]
#[derive(Debug)]
pub struct DefaultLedgerGuard {
    ledger: SharedLedger,
}

impl DefaultLedgerGuard {
    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }
}

impl Drop for DefaultLedgerGuard {
    fn drop(&mut self) {
        // The thread-local may already be gone during thread teardown.
        let _ = DEFAULT_LEDGERS.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.iter().rposition(|l| l.ptr_eq(&self.ledger)) {
                Some(position) => {
                    stack.remove(position);
                }
                None => {
                    warn!("Scoped default ledger was already popped")
                }
            }
        });
    }
}
