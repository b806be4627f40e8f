use thiserror::Error;

use super::arbiter::CycleState;
use super::variable::Variable;
use crate::domain::device::DeviceId;

/// A constraint that cannot hold together with what is already accepted.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "{device}: constraint '{constraint}' rejected{}: {reason}{}",
    variable_suffix(.variable),
    conflict_suffix(.conflicting)
)]
pub struct Infeasible {
    pub device: DeviceId,
    /// The variable whose bounds could not be satisfied, if a single one
    pub variable: Option<Variable>,
    /// Description of the rejected constraint
    pub constraint: String,
    /// Description of the accepted constraint it collides with
    pub conflicting: Option<String>,
    pub reason: String,
}

impl Infeasible {
    pub fn new(device: DeviceId, constraint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            device,
            variable: None,
            constraint: constraint.into(),
            conflicting: None,
            reason: reason.into(),
        }
    }

    pub fn on(mut self, variable: &Variable) -> Self {
        self.variable = Some(variable.clone());
        self
    }

    pub fn against(mut self, conflicting: impl Into<String>) -> Self {
        self.conflicting = Some(conflicting.into());
        self
    }
}

fn variable_suffix(variable: &Option<Variable>) -> String {
    variable
        .as_ref()
        .map(|v| format!(" on {v}"))
        .unwrap_or_default()
}

fn conflict_suffix(conflicting: &Option<String>) -> String {
    conflicting
        .as_ref()
        .map(|c| format!(" (conflicts with '{c}')"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PowerError {
    #[error(transparent)]
    Infeasible(#[from] Infeasible),

    #[error("{device}: no set-point satisfies the capacity envelope{}: {reason}", variable_suffix(.variable))]
    EnvelopeViolation {
        device: DeviceId,
        variable: Option<Variable>,
        reason: String,
    },

    #[error("{device}: submissions are closed (arbiter is {state})")]
    CycleClosed { device: DeviceId, state: CycleState },

    #[error("unknown device '{0}'")]
    UnknownDevice(DeviceId),

    #[error("device '{0}' is already registered")]
    DuplicateDevice(DeviceId),

    #[error("operation requires an idle arbiter, current state is {0}")]
    NotIdle(CycleState),
}

impl PowerError {
    pub fn envelope_violation(
        device: &DeviceId,
        variable: Option<&Variable>,
        reason: impl Into<String>,
    ) -> Self {
        PowerError::EnvelopeViolation {
            device: device.clone(),
            variable: variable.cloned(),
            reason: reason.into(),
        }
    }
}
