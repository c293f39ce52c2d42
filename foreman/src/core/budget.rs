//! Token budget tracking with edge-triggered thresholds.

use serde::{Deserialize, Serialize};

/// Signals emitted when `used` crosses a threshold from below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSignal {
    /// `warn_at` crossed: the caller should compress context.
    CompressionHint { used: u64, max: u64 },
    /// `handoff_at` crossed: checkpoint and hand off to a fresh session.
    HandoffRequested { used: u64, max: u64 },
}

/// Consumable counter against `max` with warn and handoff fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub used: u64,
    pub max: u64,
    pub warn_at: f64,
    pub handoff_at: f64,
    #[serde(default)]
    pub warned: bool,
    #[serde(default)]
    pub handoff_fired: bool,
}

impl TokenBudget {
    pub fn new(max: u64, warn_at: f64, handoff_at: f64) -> Self {
        Self {
            used: 0,
            max,
            warn_at,
            handoff_at,
            warned: false,
            handoff_fired: false,
        }
    }

    /// Add `delta` to the counter.
    pub fn add(&mut self, delta: u64) -> Vec<BudgetSignal> {
        let total = self.used.saturating_add(delta);
        self.observe(total)
    }

    /// Record an absolute `used` total. Lower totals are ignored.
    ///
    /// Each threshold fires at most once until [`TokenBudget::reset_for_session`].
    pub fn observe(&mut self, total: u64) -> Vec<BudgetSignal> {
        if total < self.used {
            return Vec::new();
        }
        self.used = total;

        let mut signals = Vec::new();
        if !self.warned && self.crossed(self.warn_at) {
            self.warned = true;
            signals.push(BudgetSignal::CompressionHint {
                used: self.used,
                max: self.max,
            });
        }
        if !self.handoff_fired && self.crossed(self.handoff_at) {
            self.handoff_fired = true;
            signals.push(BudgetSignal::HandoffRequested {
                used: self.used,
                max: self.max,
            });
        }
        signals
    }

    /// Start a new session: zero the counter and re-arm both thresholds.
    pub fn reset_for_session(&mut self) {
        self.used = 0;
        self.warned = false;
        self.handoff_fired = false;
    }

    /// Fraction of the budget consumed (0.0 when `max` is 0).
    pub fn ratio(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.used as f64 / self.max as f64
    }

    fn crossed(&self, fraction: f64) -> bool {
        self.max > 0 && self.used as f64 >= fraction * self.max as f64
    }
}
