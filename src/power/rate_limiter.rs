//! # Set-point Rate Limiting
//!
//! Caps how far any variable may move between two consecutive cycles, so a
//! device is never asked to jump from full charge to full discharge in one
//! write. The reference is the value actually written last cycle, or zero
//! when nothing was written yet.

use std::collections::BTreeMap;
use std::fmt;

use super::solver::SolvedPoint;
use super::variable::Variable;

/// Per-device rate limiter over all of the device's variables
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Maximum change per cycle (W or var); infinite disables limiting
    max_step_w: f64,

    /// Last value written per variable
    last_applied: BTreeMap<Variable, f64>,
}

impl RateLimiter {
    /// Create a limiter; `None` means unlimited
    pub fn new(max_step_w: Option<f64>) -> Self {
        let max_step_w = match max_step_w {
            Some(step) if step.is_finite() => step.max(0.0),
            _ => f64::INFINITY,
        };
        Self {
            max_step_w,
            last_applied: BTreeMap::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Create with known previous set-points, e.g. after a restart
    pub fn with_initial(
        max_step_w: Option<f64>,
        initial: impl IntoIterator<Item = (Variable, f64)>,
    ) -> Self {
        let mut limiter = Self::new(max_step_w);
        limiter.last_applied.extend(initial);
        limiter
    }

    pub fn max_step_w(&self) -> Option<f64> {
        self.max_step_w.is_finite().then_some(self.max_step_w)
    }

    pub fn is_unlimited(&self) -> bool {
        !self.max_step_w.is_finite()
    }

    /// Last written value, zero if the variable was never written
    pub fn last_applied(&self, variable: &Variable) -> f64 {
        self.last_applied.get(variable).copied().unwrap_or(0.0)
    }

    /// Values reachable this cycle: `last ± max_step`, unbounded when unlimited
    pub fn window(&self, variable: &Variable) -> (f64, f64) {
        if self.is_unlimited() {
            return (f64::NEG_INFINITY, f64::INFINITY);
        }
        let last = self.last_applied(variable);
        (last - self.max_step_w, last + self.max_step_w)
    }

    /// Limit one value against the last written one without remembering it
    pub fn limit(&self, variable: &Variable, value: f64) -> f64 {
        if self.is_unlimited() {
            return value;
        }
        let last = self.last_applied(variable);
        value
            .max(last - self.max_step_w)
            .min(last + self.max_step_w)
    }

    /// Limit every variable of a point without remembering the result
    pub fn limit_point(&self, point: &SolvedPoint) -> SolvedPoint {
        let mut limited = SolvedPoint::new(point.device().clone());
        for (var, value) in point.iter() {
            limited.set(var.clone(), self.limit(var, value));
        }
        limited
    }

    /// Limit a point and remember it as written
    pub fn apply(&mut self, point: &SolvedPoint) -> SolvedPoint {
        let limited = self.limit_point(point);
        self.record(&limited);
        limited
    }

    /// Remember the values that actually went out
    pub fn record(&mut self, point: &SolvedPoint) {
        for (var, value) in point.iter() {
            self.last_applied.insert(var.clone(), value);
        }
    }

    /// Forget history; the next cycle starts from zero
    pub fn reset(&mut self) {
        self.last_applied.clear();
    }
}

impl fmt::Display for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_step_w() {
            Some(step) => write!(
                f,
                "RateLimiter(max_step={:.0}W, tracked={})",
                step,
                self.last_applied.len()
            ),
            None => write!(f, "RateLimiter(unlimited, tracked={})", self.last_applied.len()),
        }
    }
}
