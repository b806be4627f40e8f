use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

use super::constraint::{Constraint, Relationship};
use super::constraint_set::ConstraintSet;
use super::envelope::Envelope;
use super::error::PowerError;
use super::variable::{Phase, PowerType, Variable};
use crate::domain::device::DeviceId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Slack allowed on every constraint (W or var)
    pub tolerance_w: f64,
    /// Upper bound on projection steps per device and cycle
    pub max_iterations: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance_w: 0.5,
            max_iterations: 64,
        }
    }
}

/// One value per decision variable of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolvedPoint {
    device: DeviceId,
    values: BTreeMap<Variable, f64>,
}

impl SolvedPoint {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            values: BTreeMap::new(),
        }
    }

    pub fn zero(device: DeviceId, variables: impl IntoIterator<Item = Variable>) -> Self {
        let values = variables.into_iter().map(|v| (v, 0.0)).collect();
        Self { device, values }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Value of a variable; variables never set read as zero
    pub fn get(&self, variable: &Variable) -> f64 {
        self.values.get(variable).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, variable: Variable, value: f64) {
        self.values.insert(variable, value);
    }

    pub fn value(&self, phase: Phase, power_type: PowerType) -> f64 {
        self.get(&Variable::new(self.device.clone(), phase, power_type))
    }

    /// Sum over all phases of one power type
    pub fn total(&self, power_type: PowerType) -> f64 {
        self.values
            .iter()
            .filter(|(var, _)| var.power_type == power_type)
            .map(|(_, value)| value)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, f64)> {
        self.values.iter().map(|(var, value)| (var, *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.values.values().all(|v| *v == 0.0)
    }
}

impl fmt::Display for SolvedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self
            .values
            .iter()
            .map(|(var, value)| format!("{}.{}={:.1}", var.phase, var.power_type, value))
            .join(", ");
        write!(f, "{} [{}]", self.device, values)
    }
}

/// `Σ w·x <= bound` over variable indices.
#[derive(Debug, Clone)]
struct HalfSpace {
    terms: Vec<(usize, f64)>,
    bound: f64,
    source: String,
}

impl HalfSpace {
    fn violation(&self, x: &[f64]) -> f64 {
        self.terms.iter().map(|(i, w)| w * x[*i]).sum::<f64>() - self.bound
    }
}

/// Finds a point inside the intersection of a device's constraint set and
/// its capacity envelope.
///
/// Pinned variables are fixed. Free variables start at the midpoint of
/// their bounds (or the bound closest to zero when one side is open), are
/// clamped to the intersection of bounds and envelope box, and are then
/// moved by projecting onto the most violated half-space until none is
/// violated. Coordinates that sit on their box limit and would be pushed
/// further out are left alone for that step.
#[derive(Debug, Clone, Default)]
pub struct Solver {
    config: SolverConfig,
}

impl Solver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn solve(&self, set: &ConstraintSet, envelope: &Envelope) -> Result<SolvedPoint, PowerError> {
        let device = envelope.device();
        let tol = self.config.tolerance_w;
        let variables = envelope.variables();
        let n = variables.len();

        let mut x = Vec::with_capacity(n);
        let mut lower = Vec::with_capacity(n);
        let mut upper = Vec::with_capacity(n);
        let mut pinned = vec![false; n];

        for (i, var) in variables.iter().enumerate() {
            let bounds = set.bounds(var).cloned().unwrap_or_default();
            let (env_lo, env_hi) = envelope.box_limits(var);

            if let Some(eq) = bounds.eq() {
                if eq < env_lo - tol || eq > env_hi + tol {
                    return Err(PowerError::envelope_violation(
                        device,
                        Some(var),
                        format!(
                            "pinned value {} exceeds capacity envelope [{}, {}]",
                            eq, env_lo, env_hi
                        ),
                    ));
                }
                x.push(eq);
                lower.push(eq);
                upper.push(eq);
                pinned[i] = true;
                continue;
            }

            let (lo, hi) = (bounds.lo(), bounds.hi());
            if lo > hi + tol {
                return Err(PowerError::envelope_violation(
                    device,
                    Some(var),
                    format!("lower bound {} exceeds upper bound {}", lo, hi),
                ));
            }
            let box_lo = lo.max(env_lo);
            let box_hi = hi.min(env_hi);
            if box_lo > box_hi + tol {
                return Err(PowerError::envelope_violation(
                    device,
                    Some(var),
                    format!(
                        "bounds [{}, {}] exceed capacity envelope [{}, {}]",
                        lo, hi, env_lo, env_hi
                    ),
                ));
            }
            let box_hi = box_hi.max(box_lo);
            x.push(clamp(start_value(lo, hi), box_lo, box_hi));
            lower.push(box_lo);
            upper.push(box_hi);
        }

        let half_spaces = envelope
            .half_planes()
            .iter()
            .chain(set.multi_variable_constraints())
            .map(|c| half_spaces_of(c, &variables, device))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        for iteration in 0..self.config.max_iterations {
            let Some((worst, violation)) = most_violated(&half_spaces, &x, tol) else {
                trace!(device = %device, iterations = iteration, "solver converged");
                return Ok(to_point(device, &variables, &x));
            };

            let movable: Vec<(usize, f64)> = worst
                .terms
                .iter()
                .copied()
                .filter(|(i, w)| {
                    !pinned[*i] && !(*w > 0.0 && x[*i] <= lower[*i]) && !(*w < 0.0 && x[*i] >= upper[*i])
                })
                .collect();
            let norm: f64 = movable.iter().map(|(_, w)| w * w).sum();

            if norm <= f64::EPSILON {
                let blocking = worst
                    .terms
                    .iter()
                    .find(|(i, _)| pinned[*i])
                    .or_else(|| worst.terms.first())
                    .map(|(i, _)| &variables[*i]);
                let reason = if worst.terms.iter().any(|(i, _)| pinned[*i]) {
                    format!(
                        "pinned values exceed capacity envelope, '{}' violated by {:.3}",
                        worst.source, violation
                    )
                } else {
                    format!(
                        "bounds leave no room for '{}', violated by {:.3}",
                        worst.source, violation
                    )
                };
                return Err(PowerError::envelope_violation(device, blocking, reason));
            }

            let step = violation / norm;
            for (i, w) in movable {
                x[i] = clamp(x[i] - step * w, lower[i], upper[i]);
            }
        }

        match most_violated(&half_spaces, &x, tol) {
            None => Ok(to_point(device, &variables, &x)),
            Some((worst, violation)) => Err(PowerError::envelope_violation(
                device,
                None,
                format!(
                    "no convergence after {} iterations, '{}' violated by {:.3}",
                    self.config.max_iterations, worst.source, violation
                ),
            )),
        }
    }

    /// Extremes one power type can reach in total on a device this cycle.
    ///
    /// Sums per-variable ranges: pinned variables count with their pin,
    /// free ones with their bounds cut to the envelope box and the polygon's
    /// axis extent. Returns `(0, 0)` when any variable has no room.
    pub fn power_range(
        &self,
        set: &ConstraintSet,
        envelope: &Envelope,
        power_type: PowerType,
    ) -> (f64, f64) {
        let extent = envelope.axis_extent();
        let mut total = (0.0, 0.0);

        for var in envelope
            .variables()
            .into_iter()
            .filter(|v| v.power_type == power_type)
        {
            let bounds = set.bounds(&var).cloned().unwrap_or_default();
            let (env_lo, env_hi) = envelope.box_limits(&var);
            let (lo, hi) = match bounds.eq() {
                Some(eq) => (eq, eq),
                None => (
                    bounds.lo().max(env_lo).max(-extent),
                    bounds.hi().min(env_hi).min(extent),
                ),
            };
            if lo > hi || lo < env_lo - self.config.tolerance_w || hi > env_hi + self.config.tolerance_w {
                return (0.0, 0.0);
            }
            total.0 += lo;
            total.1 += hi;
        }
        total
    }
}

fn half_spaces_of(
    constraint: &Constraint,
    variables: &[Variable],
    device: &DeviceId,
) -> Result<Vec<HalfSpace>, PowerError> {
    let terms = constraint
        .coefficients()
        .iter()
        .map(|c| {
            variables
                .iter()
                .position(|v| v == &c.variable)
                .map(|i| (i, c.weight))
                .ok_or_else(|| {
                    PowerError::envelope_violation(
                        device,
                        Some(&c.variable),
                        format!(
                            "'{}' references a variable the device does not expose",
                            constraint.description()
                        ),
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let source = constraint.description().to_owned();
    let target = constraint.target();
    let negated = || terms.iter().map(|(i, w)| (*i, -w)).collect::<Vec<_>>();

    Ok(match constraint.relationship() {
        Relationship::LessOrEquals => vec![HalfSpace {
            terms: terms.clone(),
            bound: target,
            source,
        }],
        Relationship::GreaterOrEquals => vec![HalfSpace {
            terms: negated(),
            bound: -target,
            source,
        }],
        Relationship::Equals => vec![
            HalfSpace {
                terms: terms.clone(),
                bound: target,
                source: source.clone(),
            },
            HalfSpace {
                terms: negated(),
                bound: -target,
                source,
            },
        ],
    })
}

/// Largest violation above tolerance; ties resolve to the first half-space
fn most_violated<'a>(
    half_spaces: &'a [HalfSpace],
    x: &[f64],
    tolerance: f64,
) -> Option<(&'a HalfSpace, f64)> {
    half_spaces
        .iter()
        .map(|h| (h, h.violation(x)))
        .filter(|(_, violation)| *violation > tolerance)
        .rev()
        .max_by_key(|(_, violation)| OrderedFloat(*violation))
}

fn to_point(device: &DeviceId, variables: &[Variable], x: &[f64]) -> SolvedPoint {
    SolvedPoint {
        device: device.clone(),
        values: variables.iter().cloned().zip(x.iter().copied()).collect(),
    }
}

/// Midpoint of a closed interval, otherwise the value closest to zero
fn start_value(lo: f64, hi: f64) -> f64 {
    if lo.is_finite() && hi.is_finite() {
        (lo + hi) / 2.0
    } else {
        clamp(0.0, lo, hi)
    }
}

/// Like `f64::clamp` but never panics on `lo > hi`
fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}
