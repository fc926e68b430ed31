//! Cost tracking against an optional limit.
//!
//! # Invariants
//! - `used` is non-decreasing
//! - The warning fires at most once per tracker
//! - The exceeded signal fires at most once per tracker
//!
//! All mutations go through methods that enforce these.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Fraction of the limit at which a warning is raised.
pub const WARNING_RATIO: f64 = 0.8;

/// Outcome of a budget check after a cost update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetCheck {
    /// Below the warning threshold, already warned, or no limit configured
    Ok,
    /// `used / limit` crossed 80% for the first time
    Warning { used: f64, limit: f64 },
    /// `used / limit` reached 100%
    Exceeded { used: f64, limit: f64 },
}

/// Cumulative cost of one run.
///
/// # Design for Provability
/// Fields are private; `add` is the only way `used` changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetTracker {
    limit: Option<f64>,
    used: f64,
    warned: bool,
    exceeded: bool,
}

impl BudgetTracker {
    /// Create a tracker with nothing spent.
    ///
    /// # Postconditions
    /// - `tracker.used() == 0.0`
    /// - `tracker.limit() == limit`
    pub fn new(limit: Option<f64>) -> Self {
        Self {
            limit,
            used: 0.0,
            warned: false,
            exceeded: false,
        }
    }

    /// Create a tracker that resumes from already-spent cost.
    ///
    /// A resumed tracker that is already past the warning line does not warn
    /// again.
    pub fn resumed(limit: Option<f64>, used: f64) -> Self {
        let mut tracker = Self::new(limit);
        if used.is_finite() && used > 0.0 {
            tracker.used = used;
        }
        if let Some(limit) = limit {
            tracker.warned = tracker.used / limit >= WARNING_RATIO;
        }
        tracker
    }

    pub fn limit(&self) -> Option<f64> {
        self.limit
    }

    pub fn used(&self) -> f64 {
        self.used
    }

    /// Remaining budget, `None` when unlimited.
    pub fn remaining(&self) -> Option<f64> {
        self.limit.map(|limit| (limit - self.used).max(0.0))
    }

    /// `used / limit`, `None` when unlimited.
    pub fn ratio(&self) -> Option<f64> {
        self.limit.map(|limit| self.used / limit)
    }

    pub fn is_exceeded(&self) -> bool {
        self.exceeded
    }

    /// Record spending and check thresholds.
    ///
    /// # Postcondition
    /// `self.used() >= old_used`
    pub fn add(&mut self, cost: f64) -> BudgetCheck {
        if cost.is_finite() && cost > 0.0 {
            self.used += cost;
        }
        self.check()
    }

    /// Check thresholds without spending.
    pub fn check(&mut self) -> BudgetCheck {
        let Some(limit) = self.limit else {
            return BudgetCheck::Ok;
        };
        let ratio = self.used / limit;

        if ratio >= 1.0 {
            if self.exceeded {
                return BudgetCheck::Ok;
            }
            self.exceeded = true;
            self.warned = true;
            return BudgetCheck::Exceeded {
                used: self.used,
                limit,
            };
        }
        if ratio >= WARNING_RATIO && !self.warned {
            self.warned = true;
            return BudgetCheck::Warning {
                used: self.used,
                limit,
            };
        }
        BudgetCheck::Ok
    }
}

/// Shared live view of a run's budget, handed to steps through `StepContext`.
#[derive(Debug, Clone)]
pub struct BudgetHandle {
    inner: Arc<RwLock<BudgetTracker>>,
}

impl BudgetHandle {
    pub fn new(tracker: BudgetTracker) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tracker)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(BudgetTracker::new(None))
    }

    pub fn used(&self) -> f64 {
        self.read(|t| t.used())
    }

    pub fn limit(&self) -> Option<f64> {
        self.read(|t| t.limit())
    }

    pub fn remaining(&self) -> Option<f64> {
        self.read(|t| t.remaining())
    }

    /// Whether spending `cost` more would stay within the limit.
    pub fn can_afford(&self, cost: f64) -> bool {
        self.read(|t| match t.limit() {
            Some(limit) => t.used() + cost < limit,
            None => true,
        })
    }

    /// Record cost and return the threshold outcome.
    pub(crate) fn add(&self, cost: f64) -> BudgetCheck {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.add(cost)
    }

    fn read<T>(&self, f: impl FnOnce(&BudgetTracker) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_limit_is_noop() {
        let mut tracker = BudgetTracker::new(None);
        assert_eq!(tracker.add(1_000.0), BudgetCheck::Ok);
        assert_eq!(tracker.remaining(), None);
        assert_eq!(tracker.used(), 1_000.0);
    }

    #[test]
    fn test_warning_fires_once_then_exceeded_once() {
        let mut tracker = BudgetTracker::new(Some(1.0));
        assert_eq!(tracker.add(0.5), BudgetCheck::Ok);
        match tracker.add(0.35) {
            BudgetCheck::Warning { used, limit } => {
                assert!((used - 0.85).abs() < 1e-9);
                assert_eq!(limit, 1.0);
            }
            other => panic!("expected a warning, got {:?}", other),
        }
        assert_eq!(tracker.add(0.05), BudgetCheck::Ok);
        assert!(matches!(tracker.add(0.2), BudgetCheck::Exceeded { .. }));
        assert_eq!(tracker.add(0.2), BudgetCheck::Ok);
        assert!(tracker.is_exceeded());
    }

    #[test]
    fn test_jump_straight_past_limit_reports_exceeded() {
        let mut tracker = BudgetTracker::new(Some(1.0));
        assert!(matches!(tracker.add(2.0), BudgetCheck::Exceeded { .. }));
        assert_eq!(tracker.remaining(), Some(0.0));
    }

    #[test]
    fn test_negative_cost_ignored() {
        let mut tracker = BudgetTracker::new(Some(1.0));
        tracker.add(0.3);
        tracker.add(-0.2);
        assert!((tracker.used() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_resumed_tracker_does_not_rewarn() {
        let mut tracker = BudgetTracker::resumed(Some(1.0), 0.9);
        assert_eq!(tracker.add(0.01), BudgetCheck::Ok);
    }

    #[test]
    fn test_handle_shares_state() {
        let handle = BudgetHandle::new(BudgetTracker::new(Some(2.0)));
        let clone = handle.clone();
        clone.add(0.5);
        assert_eq!(handle.used(), 0.5);
        assert_eq!(handle.remaining(), Some(1.5));
        assert!(handle.can_afford(1.0));
        assert!(!handle.can_afford(1.5));
    }
}
