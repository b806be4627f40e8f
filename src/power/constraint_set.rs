use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use super::constraint::{Coefficient, Constraint, Relationship};
use super::error::Infeasible;
use super::variable::Variable;
use crate::domain::device::DeviceId;

/// Name used as the conflicting source when a bound collides with the
/// physical limits installed at cycle start.
pub const ENVELOPE_SOURCE: &str = "capacity envelope";

/// One side of a variable's interval and the constraint that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bound {
    pub value: f64,
    pub source: String,
}

/// Tightest bounds accepted so far for one variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VariableBounds {
    lo: Option<Bound>,
    hi: Option<Bound>,
    eq: Option<Bound>,
}

impl VariableBounds {
    pub fn lo(&self) -> f64 {
        self.lo.as_ref().map_or(f64::NEG_INFINITY, |b| b.value)
    }

    pub fn hi(&self) -> f64 {
        self.hi.as_ref().map_or(f64::INFINITY, |b| b.value)
    }

    pub fn eq(&self) -> Option<f64> {
        self.eq.as_ref().map(|b| b.value)
    }

    pub fn lo_bound(&self) -> Option<&Bound> {
        self.lo.as_ref()
    }

    pub fn hi_bound(&self) -> Option<&Bound> {
        self.hi.as_ref()
    }

    pub fn eq_bound(&self) -> Option<&Bound> {
        self.eq.as_ref()
    }

    /// Values still open to the variable: the pin if there is one
    pub fn interval(&self) -> (f64, f64) {
        match self.eq() {
            Some(eq) => (eq, eq),
            None => (self.lo(), self.hi()),
        }
    }
}

enum BoundUpdate {
    Upper(f64),
    Lower(f64),
    Pin(f64),
}

/// Restore point for [`ConstraintSet::rollback`].
#[derive(Debug, Clone)]
pub struct Checkpoint {
    constraints: usize,
    bounds: BTreeMap<Variable, VariableBounds>,
}

/// Constraints accepted for one device during the current cycle.
///
/// Single-variable constraints are reduced to per-variable bounds as they
/// arrive, so the first accepted EQUALS on a variable wins and later
/// LESS/GREATER constraints can only tighten. Multi-variable constraints are
/// kept for the solver and propagate conservative interval bounds onto each
/// of their variables.
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    device: DeviceId,
    tolerance: f64,
    constraints: Vec<Constraint>,
    bounds: BTreeMap<Variable, VariableBounds>,
    limits: BTreeMap<Variable, (f64, f64)>,
}

impl ConstraintSet {
    pub fn new(device: DeviceId, tolerance: f64) -> Self {
        Self {
            device,
            tolerance,
            constraints: Vec::new(),
            bounds: BTreeMap::new(),
            limits: BTreeMap::new(),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn bounds(&self, variable: &Variable) -> Option<&VariableBounds> {
        self.bounds.get(variable)
    }

    pub fn pinned(&self, variable: &Variable) -> Option<f64> {
        self.bounds.get(variable).and_then(|b| b.eq())
    }

    pub fn limits(&self, variable: &Variable) -> Option<(f64, f64)> {
        self.limits.get(variable).copied()
    }

    /// Physical box of a variable for this cycle, checked by
    /// [`validate_and_add`](Self::validate_and_add)
    pub fn set_limits(&mut self, variable: Variable, min: f64, max: f64) {
        self.limits.insert(variable, (min, max));
    }

    /// Interval a variable can still take given accepted bounds and limits
    pub fn feasible_range(&self, variable: &Variable) -> (f64, f64) {
        let (mut lo, mut hi) = self
            .bounds
            .get(variable)
            .map_or((f64::NEG_INFINITY, f64::INFINITY), |b| b.interval());
        if let Some((min, max)) = self.limits(variable) {
            lo = lo.max(min);
            hi = hi.min(max);
        }
        (lo, hi)
    }

    pub fn multi_variable_constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(|c| c.coefficients().len() > 1)
    }

    /// Drops every constraint, bound and limit. Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.constraints.clear();
        self.bounds.clear();
        self.limits.clear();
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            constraints: self.constraints.len(),
            bounds: self.bounds.clone(),
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.constraints.truncate(checkpoint.constraints);
        self.bounds = checkpoint.bounds;
    }

    /// Accepts a constraint and folds it into the variable bounds.
    ///
    /// Fails without changing anything when the constraint pins a variable
    /// to a value that an earlier constraint already excludes.
    pub fn add(&mut self, constraint: Constraint) -> Result<(), Infeasible> {
        self.check_scope(&constraint)?;

        let updates = self.derive_updates(&constraint);
        for (variable, update) in &updates {
            if let BoundUpdate::Pin(value) = update {
                self.check_pin(&constraint, variable, *value)?;
            }
        }
        for (variable, update) in updates {
            self.apply(&constraint, variable, update);
        }

        trace!(device = %self.device, constraint = %constraint, "constraint accepted");
        self.constraints.push(constraint);
        Ok(())
    }

    /// Like [`add`](Self::add), but also rejects a constraint that leaves a
    /// touched variable with an empty interval or outside its physical
    /// limits. A rejected constraint leaves the set exactly as before.
    pub fn validate_and_add(&mut self, constraint: Constraint) -> Result<(), Infeasible> {
        let touched: Vec<Variable> = constraint.variables().cloned().collect();
        let saved: Vec<(Variable, Option<VariableBounds>)> = touched
            .iter()
            .map(|v| (v.clone(), self.bounds.get(v).cloned()))
            .collect();
        let description = constraint.description().to_owned();

        self.add(constraint)?;

        if let Some(err) = touched
            .iter()
            .find_map(|v| self.check_consistent(&description, v).err())
        {
            for (variable, previous) in saved {
                match previous {
                    Some(bounds) => self.bounds.insert(variable, bounds),
                    None => self.bounds.remove(&variable),
                };
            }
            self.constraints.pop();
            debug!(device = %self.device, error = %err, "constraint rejected");
            return Err(err);
        }
        Ok(())
    }

    fn check_scope(&self, constraint: &Constraint) -> Result<(), Infeasible> {
        if !constraint.is_finite() {
            return Err(Infeasible::new(
                self.device.clone(),
                constraint.description(),
                "weights and target must be finite",
            ));
        }
        if let Some(foreign) = constraint.variables().find(|v| v.device != self.device) {
            return Err(Infeasible::new(
                self.device.clone(),
                constraint.description(),
                format!("references {foreign} of another device"),
            )
            .on(foreign));
        }
        if constraint.coefficients().is_empty()
            && !constraint
                .relationship()
                .holds(0.0, constraint.target(), self.tolerance)
        {
            return Err(Infeasible::new(
                self.device.clone(),
                constraint.description(),
                format!(
                    "has no variables and 0 {} {} never holds",
                    constraint.relationship().symbol(),
                    constraint.target()
                ),
            ));
        }
        Ok(())
    }

    fn derive_updates(&self, constraint: &Constraint) -> Vec<(Variable, BoundUpdate)> {
        let target = constraint.target();
        let relationship = constraint.relationship();

        match constraint.coefficients() {
            [] => Vec::new(),
            [only] => {
                let value = target / only.weight;
                let relationship = if only.weight < 0.0 {
                    relationship.flipped()
                } else {
                    relationship
                };
                let update = match relationship {
                    Relationship::Equals => BoundUpdate::Pin(value),
                    Relationship::LessOrEquals => BoundUpdate::Upper(value),
                    Relationship::GreaterOrEquals => BoundUpdate::Lower(value),
                };
                vec![(only.variable.clone(), update)]
            }
            coefficients => {
                let wants_upper = relationship != Relationship::GreaterOrEquals;
                let wants_lower = relationship != Relationship::LessOrEquals;
                let mut updates = Vec::new();

                for (j, cj) in coefficients.iter().enumerate() {
                    let (rest_min, rest_max) = coefficients
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != j)
                        .fold((0.0, 0.0), |(min, max), (_, c)| {
                            let (lo, hi) = self.feasible_range(&c.variable);
                            let (a, b) = (c.weight * lo, c.weight * hi);
                            (min + a.min(b), max + a.max(b))
                        });

                    // w_j * x_j <= target - rest_min, w_j * x_j >= target - rest_max
                    if wants_upper && rest_min.is_finite() {
                        updates.push(scaled_update(cj, target - rest_min, true));
                    }
                    if wants_lower && rest_max.is_finite() {
                        updates.push(scaled_update(cj, target - rest_max, false));
                    }
                }
                updates
            }
        }
    }

    fn check_pin(
        &self,
        constraint: &Constraint,
        variable: &Variable,
        value: f64,
    ) -> Result<(), Infeasible> {
        let tol = self.tolerance;
        let reject = |reason: String| {
            Infeasible::new(self.device.clone(), constraint.description(), reason).on(variable)
        };

        let bounds = self.bounds.get(variable).cloned().unwrap_or_default();
        if let Some(eq) = bounds.eq_bound() {
            if (value - eq.value).abs() > tol {
                return Err(reject(format!(
                    "already pinned to {} W, requested {} W",
                    eq.value, value
                ))
                .against(eq.source.clone()));
            }
            return Ok(());
        }
        if let Some(lo) = bounds.lo_bound() {
            if value < lo.value - tol {
                return Err(reject(format!(
                    "{} W is below the lower bound {} W",
                    value, lo.value
                ))
                .against(lo.source.clone()));
            }
        }
        if let Some(hi) = bounds.hi_bound() {
            if value > hi.value + tol {
                return Err(reject(format!(
                    "{} W is above the upper bound {} W",
                    value, hi.value
                ))
                .against(hi.source.clone()));
            }
        }
        if let Some((min, max)) = self.limits(variable) {
            if value < min - tol || value > max + tol {
                return Err(reject(format!(
                    "{} W is outside the physical limits [{}, {}] W",
                    value, min, max
                ))
                .against(ENVELOPE_SOURCE));
            }
        }
        Ok(())
    }

    fn apply(&mut self, constraint: &Constraint, variable: Variable, update: BoundUpdate) {
        let bound = |value: f64| Bound {
            value,
            source: constraint.description().to_owned(),
        };
        let entry = self.bounds.entry(variable).or_default();
        match update {
            BoundUpdate::Upper(value) if value < entry.hi() => entry.hi = Some(bound(value)),
            BoundUpdate::Lower(value) if value > entry.lo() => entry.lo = Some(bound(value)),
            BoundUpdate::Pin(value) if entry.eq.is_none() => entry.eq = Some(bound(value)),
            _ => {}
        }
    }

    fn check_consistent(&self, description: &str, variable: &Variable) -> Result<(), Infeasible> {
        let tol = self.tolerance;
        let reject = |reason: String, other: Option<&Bound>| {
            let err =
                Infeasible::new(self.device.clone(), description, reason).on(variable);
            match other {
                Some(b) if b.source != description => err.against(b.source.clone()),
                _ => err,
            }
        };

        let Some(bounds) = self.bounds.get(variable) else {
            return Ok(());
        };
        let (lo, hi) = (bounds.lo(), bounds.hi());

        if lo > hi + tol {
            let other = match bounds.hi_bound() {
                Some(h) if h.source == description => bounds.lo_bound(),
                other => other,
            };
            return Err(reject(
                format!("lower bound {} W exceeds upper bound {} W", lo, hi),
                other,
            ));
        }
        if let Some(eq) = bounds.eq_bound() {
            if eq.value < lo - tol || eq.value > hi + tol {
                return Err(reject(
                    format!("pinned value {} W lies outside [{}, {}] W", eq.value, lo, hi),
                    Some(eq),
                ));
            }
        }
        if let Some((min, max)) = self.limits(variable) {
            let (lo, hi) = bounds.interval();
            if lo > max + tol || hi < min - tol {
                return Err(Infeasible::new(
                    self.device.clone(),
                    description,
                    format!(
                        "[{}, {}] W does not overlap the physical limits [{}, {}] W",
                        lo, hi, min, max
                    ),
                )
                .on(variable)
                .against(ENVELOPE_SOURCE));
            }
        }
        Ok(())
    }
}

fn scaled_update(coefficient: &Coefficient, weighted: f64, upper: bool) -> (Variable, BoundUpdate) {
    let value = weighted / coefficient.weight;
    let update = match (upper, coefficient.weight > 0.0) {
        (true, true) | (false, false) => BoundUpdate::Upper(value),
        (true, false) | (false, true) => BoundUpdate::Lower(value),
    };
    (coefficient.variable.clone(), update)
}
