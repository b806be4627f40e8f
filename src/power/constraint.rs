use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

use super::variable::{Phase, Variable};
use crate::domain::device::{DeviceId, DeviceKind};

/// Weights below this are treated as zero and dropped.
const WEIGHT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Relationship {
    Equals,
    LessOrEquals,
    GreaterOrEquals,
}

impl Relationship {
    pub fn symbol(&self) -> &'static str {
        match self {
            Relationship::Equals => "=",
            Relationship::LessOrEquals => "<=",
            Relationship::GreaterOrEquals => ">=",
        }
    }

    /// Relationship after multiplying both sides by a negative number
    pub fn flipped(self) -> Self {
        match self {
            Relationship::Equals => Relationship::Equals,
            Relationship::LessOrEquals => Relationship::GreaterOrEquals,
            Relationship::GreaterOrEquals => Relationship::LessOrEquals,
        }
    }

    pub fn holds(&self, lhs: f64, target: f64, tolerance: f64) -> bool {
        match self {
            Relationship::Equals => (lhs - target).abs() <= tolerance,
            Relationship::LessOrEquals => lhs <= target + tolerance,
            Relationship::GreaterOrEquals => lhs >= target - tolerance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub variable: Variable,
    pub weight: f64,
}

impl Coefficient {
    pub fn new(variable: Variable, weight: f64) -> Self {
        Self { variable, weight }
    }
}

/// A linear constraint `Σ weight·variable (relationship) target`.
///
/// Immutable once built. Duplicate variables are merged on construction and
/// zero weights dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    description: String,
    coefficients: Vec<Coefficient>,
    relationship: Relationship,
    target: f64,
}

impl Constraint {
    pub fn new(
        description: impl Into<String>,
        coefficients: Vec<Coefficient>,
        relationship: Relationship,
        target: f64,
    ) -> Self {
        let mut merged: Vec<Coefficient> = Vec::with_capacity(coefficients.len());
        for coefficient in coefficients {
            match merged.iter_mut().find(|c| c.variable == coefficient.variable) {
                Some(existing) => existing.weight += coefficient.weight,
                None => merged.push(coefficient),
            }
        }
        merged.retain(|c| c.weight.abs() > WEIGHT_EPSILON || c.weight.is_nan());

        Self {
            description: description.into(),
            coefficients: merged,
            relationship,
            target,
        }
    }

    /// Single variable with weight 1
    pub fn simple(
        description: impl Into<String>,
        variable: Variable,
        relationship: Relationship,
        target: f64,
    ) -> Self {
        Self::new(
            description,
            vec![Coefficient::new(variable, 1.0)],
            relationship,
            target,
        )
    }

    pub fn equals(description: impl Into<String>, variable: Variable, target: f64) -> Self {
        Self::simple(description, variable, Relationship::Equals, target)
    }

    pub fn less_or_equals(description: impl Into<String>, variable: Variable, target: f64) -> Self {
        Self::simple(description, variable, Relationship::LessOrEquals, target)
    }

    pub fn greater_or_equals(
        description: impl Into<String>,
        variable: Variable,
        target: f64,
    ) -> Self {
        Self::simple(description, variable, Relationship::GreaterOrEquals, target)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn coefficients(&self) -> &[Coefficient] {
        &self.coefficients
    }

    pub fn relationship(&self) -> Relationship {
        self.relationship
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.coefficients.iter().map(|c| &c.variable)
    }

    /// The variable and weight of a single-variable constraint
    pub fn single(&self) -> Option<&Coefficient> {
        match self.coefficients.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.target.is_finite() && self.coefficients.iter().all(|c| c.weight.is_finite())
    }

    /// Devices referenced by the coefficients, deduplicated
    pub fn devices(&self) -> Vec<&DeviceId> {
        self.coefficients
            .iter()
            .map(|c| &c.variable.device)
            .unique()
            .collect()
    }

    pub fn lhs(&self, value_of: impl Fn(&Variable) -> f64) -> f64 {
        self.coefficients
            .iter()
            .map(|c| c.weight * value_of(&c.variable))
            .sum()
    }

    pub fn is_satisfied_by(&self, value_of: impl Fn(&Variable) -> f64, tolerance: f64) -> bool {
        self.relationship
            .holds(self.lhs(value_of), self.target, tolerance)
    }

    /// Rewrites the constraint onto the variables a device actually has.
    ///
    /// On a symmetric device a per-phase term folds into `ALL` with a third
    /// of its weight. On an asymmetric device a single-variable `ALL`
    /// constraint becomes three per-phase constraints whose targets sum to
    /// the original (remainder on L1); an `ALL` term inside a multi-variable
    /// constraint is spread over L1+L2+L3 with the same weight.
    pub fn expand(&self, kind: DeviceKind) -> Vec<Constraint> {
        match kind {
            DeviceKind::Symmetric => {
                if self.coefficients.iter().all(|c| c.variable.phase == Phase::All) {
                    return vec![self.clone()];
                }
                let folded = self
                    .coefficients
                    .iter()
                    .map(|c| match c.variable.phase {
                        Phase::All => c.clone(),
                        _ => Coefficient::new(c.variable.with_phase(Phase::All), c.weight / 3.0),
                    })
                    .collect();
                vec![Constraint::new(
                    self.description.clone(),
                    folded,
                    self.relationship,
                    self.target,
                )]
            }
            DeviceKind::Asymmetric => {
                if !self.coefficients.iter().any(|c| c.variable.phase == Phase::All) {
                    return vec![self.clone()];
                }
                if let Some(only) = self.single() {
                    return split_target(self.target)
                        .into_iter()
                        .zip(Phase::SINGLE)
                        .map(|(target, phase)| Constraint {
                            description: format!("{} [{}]", self.description, phase),
                            coefficients: vec![Coefficient::new(
                                only.variable.with_phase(phase),
                                only.weight,
                            )],
                            relationship: self.relationship,
                            target,
                        })
                        .collect();
                }
                let spread = self
                    .coefficients
                    .iter()
                    .flat_map(|c| match c.variable.phase {
                        Phase::All => Phase::SINGLE
                            .iter()
                            .map(|phase| Coefficient::new(c.variable.with_phase(*phase), c.weight))
                            .collect::<Vec<_>>(),
                        _ => vec![c.clone()],
                    })
                    .collect();
                vec![Constraint::new(
                    self.description.clone(),
                    spread,
                    self.relationship,
                    self.target,
                )]
            }
        }
    }
}

/// Splits an aggregate target into L1/L2/L3 shares. L2 and L3 get the
/// truncated third, L1 absorbs the remainder so the shares sum exactly.
pub(crate) fn split_target(target: f64) -> [f64; 3] {
    let share = (target / 3.0).trunc();
    [target - 2.0 * share, share, share]
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lhs = self
            .coefficients
            .iter()
            .map(|c| format!("{}*{}", c.weight, c.variable))
            .join(" + ");
        write!(
            f,
            "[{}] {} {} {}",
            self.description,
            lhs,
            self.relationship.symbol(),
            self.target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::variable::PowerType;

    fn p(device: &str, phase: Phase) -> Variable {
        Variable::active(device, phase)
    }

    #[test]
    fn test_merges_duplicate_variables() {
        let c = Constraint::new(
            "dup",
            vec![
                Coefficient::new(p("ess0", Phase::All), 1.0),
                Coefficient::new(p("ess0", Phase::All), 2.0),
                Coefficient::new(Variable::reactive("ess0", Phase::All), 0.0),
            ],
            Relationship::LessOrEquals,
            10.0,
        );
        assert_eq!(c.coefficients().len(), 1);
        assert_eq!(c.coefficients()[0].weight, 3.0);
        assert!(c.single().is_some());
    }

    #[test]
    fn test_relationship_flip() {
        assert_eq!(Relationship::LessOrEquals.flipped(), Relationship::GreaterOrEquals);
        assert_eq!(Relationship::Equals.flipped(), Relationship::Equals);
        assert!(Relationship::Equals.holds(10.4, 10.0, 0.5));
        assert!(!Relationship::LessOrEquals.holds(11.0, 10.0, 0.5));
    }

    #[test]
    fn test_split_target_sums_exactly() {
        assert_eq!(split_target(10_000.0), [3334.0, 3333.0, 3333.0]);
        assert_eq!(split_target(-5000.0), [-1668.0, -1666.0, -1666.0]);
        assert_eq!(split_target(0.0), [0.0, 0.0, 0.0]);
        let shares = split_target(7.5);
        assert_eq!(shares.iter().sum::<f64>(), 7.5);
    }

    #[test]
    fn test_expand_all_on_asymmetric_device() {
        let c = Constraint::equals("balancing", p("ess1", Phase::All), 10_000.0);
        let parts = c.expand(DeviceKind::Asymmetric);
        assert_eq!(parts.len(), 3);
        let targets: Vec<f64> = parts.iter().map(|c| c.target()).collect();
        assert_eq!(targets, vec![3334.0, 3333.0, 3333.0]);
        assert_eq!(parts[1].single().unwrap().variable.phase, Phase::L2);
        assert_eq!(parts[2].description(), "balancing [L3]");
    }

    #[test]
    fn test_expand_multi_variable_all_term_spreads() {
        let c = Constraint::new(
            "sum",
            vec![
                Coefficient::new(p("ess1", Phase::All), 1.0),
                Coefficient::new(Variable::reactive("ess1", Phase::L2), 2.0),
            ],
            Relationship::LessOrEquals,
            100.0,
        );
        let parts = c.expand(DeviceKind::Asymmetric);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].coefficients().len(), 4);
        assert!(parts[0]
            .variables()
            .all(|v| v.phase != Phase::All));
    }

    #[test]
    fn test_expand_phase_on_symmetric_device_folds() {
        let c = Constraint::less_or_equals("l1 limit", p("ess0", Phase::L1), 1000.0);
        let parts = c.expand(DeviceKind::Symmetric);
        assert_eq!(parts.len(), 1);
        let only = parts[0].single().unwrap();
        assert_eq!(only.variable.phase, Phase::All);
        assert!((only.weight - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(parts[0].target(), 1000.0);
    }

    #[test]
    fn test_expand_native_variables_unchanged() {
        let c = Constraint::equals("x", p("ess0", Phase::All), 5.0);
        assert_eq!(c.expand(DeviceKind::Symmetric), vec![c.clone()]);
        let c = Constraint::equals("y", p("ess1", Phase::L3), 5.0);
        assert_eq!(c.expand(DeviceKind::Asymmetric), vec![c.clone()]);
    }

    #[test]
    fn test_evaluate() {
        let c = Constraint::new(
            "pq",
            vec![
                Coefficient::new(p("ess0", Phase::All), 1.0),
                Coefficient::new(Variable::new("ess0", Phase::All, PowerType::Reactive), -1.0),
            ],
            Relationship::GreaterOrEquals,
            0.0,
        );
        let values = |v: &Variable| match v.power_type {
            PowerType::Active => 100.0,
            PowerType::Reactive => 50.0,
        };
        assert_eq!(c.lhs(values), 50.0);
        assert!(c.is_satisfied_by(values, 0.0));
        assert_eq!(c.devices().len(), 1);
    }

    #[test]
    fn test_display() {
        let c = Constraint::less_or_equals("cap", p("ess0", Phase::All), 10.0);
        assert_eq!(c.to_string(), "[cap] 1*ess0.ALL.ACTIVE <= 10");
    }
}
