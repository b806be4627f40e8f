//! Rounding of set-points to the resolution an inverter accepts.
//!
//! Rounding direction depends on state of charge so that the error always
//! works in the battery's favour: while discharging above 50 % or charging
//! below 50 % the magnitude is rounded up, otherwise down. Active and
//! reactive values are rounded alike.
//!
//! Rounding never takes a value out of its rate-limit window. When the
//! preferred direction would, the other one is used, and when neither
//! multiple fits the value is written unrounded.

use super::solver::SolvedPoint;
use super::variable::Variable;

/// Residual below which a quotient counts as an exact multiple.
const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Away from zero
    Up,
    /// Towards zero
    Down,
}

pub fn rounding_direction(value: f64, soc_percent: Option<f64>) -> Rounding {
    match soc_percent {
        Some(soc) if (value > 0.0 && soc > 50.0) || (value < 0.0 && soc < 50.0) => Rounding::Up,
        _ => Rounding::Down,
    }
}

/// Rounds the magnitude of `value` to a multiple of `precision`
pub fn round_to_precision(value: f64, precision: f64, rounding: Rounding) -> f64 {
    if precision <= 0.0 || !precision.is_finite() || !value.is_finite() {
        return value;
    }
    let steps = value.abs() / precision;
    let nearest = steps.round();
    let steps = if (steps - nearest).abs() < STEP_EPSILON {
        nearest
    } else {
        match rounding {
            Rounding::Up => steps.ceil(),
            Rounding::Down => steps.floor(),
        }
    };
    value.signum() * steps * precision
}

impl Rounding {
    pub fn opposite(self) -> Self {
        match self {
            Rounding::Up => Rounding::Down,
            Rounding::Down => Rounding::Up,
        }
    }
}

/// Rounds `value` like [`round_to_precision`] but keeps the result inside
/// `[lo, hi]`
pub fn round_within(
    value: f64,
    precision: f64,
    rounding: Rounding,
    (lo, hi): (f64, f64),
) -> f64 {
    let fits = |v: f64| v >= lo && v <= hi;
    [rounding, rounding.opposite()]
        .into_iter()
        .map(|r| round_to_precision(value, precision, r))
        .find(|v| fits(*v))
        .unwrap_or(value)
}

/// Rounds every variable of a point, each within the window `window`
/// returns for it
pub fn round_point(
    point: &SolvedPoint,
    precision: f64,
    soc_percent: Option<f64>,
    window: impl Fn(&Variable) -> (f64, f64),
) -> SolvedPoint {
    let mut rounded = SolvedPoint::new(point.device().clone());
    for (var, value) in point.iter() {
        let rounding = rounding_direction(value, soc_percent);
        rounded.set(
            var.clone(),
            round_within(value, precision, rounding, window(var)),
        );
    }
    rounded
}
