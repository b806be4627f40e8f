use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use super::envelope::DegradeReason;
use super::error::PowerError;
use super::variable::Variable;
use crate::domain::device::DeviceId;

/// Why a device was driven to zero, or is running on a degraded envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultReason {
    /// No point satisfies the accepted constraints within the envelope
    EnvelopeViolation {
        variable: Option<Variable>,
        reason: String,
    },
    /// Telemetry was unusable and the envelope collapsed to zero
    EnvelopeDegraded { reason: DegradeReason },
}

impl FaultReason {
    /// Maps a solver failure onto the fault raised for the device
    pub fn from_error(error: &PowerError) -> Self {
        match error {
            PowerError::EnvelopeViolation {
                variable, reason, ..
            } => FaultReason::EnvelopeViolation {
                variable: variable.clone(),
                reason: reason.clone(),
            },
            PowerError::Infeasible(infeasible) => FaultReason::EnvelopeViolation {
                variable: infeasible.variable.clone(),
                reason: infeasible.to_string(),
            },
            other => FaultReason::EnvelopeViolation {
                variable: None,
                reason: other.to_string(),
            },
        }
    }

    pub fn is_violation(&self) -> bool {
        matches!(self, FaultReason::EnvelopeViolation { .. })
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::EnvelopeViolation {
                variable: Some(variable),
                reason,
            } => write!(f, "envelope violation on {variable}: {reason}"),
            FaultReason::EnvelopeViolation {
                variable: None,
                reason,
            } => write!(f, "envelope violation: {reason}"),
            FaultReason::EnvelopeDegraded { reason } => write!(f, "envelope degraded: {reason}"),
        }
    }
}

/// Receiver for device faults, e.g. a state channel towards the UI.
///
/// Called once per cycle for as long as the fault persists.
pub trait FaultSink: Send {
    fn raise(&mut self, device: &DeviceId, fault: &FaultReason);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub device: DeviceId,
    pub reason: FaultReason,
}

/// Bounded history of raised faults, oldest dropped first.
#[derive(Debug, Clone)]
pub struct FaultLog {
    records: VecDeque<FaultRecord>,
    capacity: usize,
}

impl FaultLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, record: FaultRecord) {
        self.records.push_back(record);
        if self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// The `count` most recent records, oldest first
    pub fn recent(&self, count: usize) -> Vec<FaultRecord> {
        let start = self.records.len().saturating_sub(count);
        self.records.iter().skip(start).cloned().collect()
    }

    pub fn for_device<'a>(&'a self, device: &'a DeviceId) -> impl Iterator<Item = &'a FaultRecord> {
        self.records.iter().filter(move |r| &r.device == device)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FaultRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new(100)
    }
}
