use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::Display;
use tracing::{debug, error, warn};
use validator::Validate;

use super::constraint::Constraint;
use super::constraint_set::ConstraintSet;
use super::envelope::{DegradeReason, Envelope};
use super::error::{Infeasible, PowerError};
use super::fault::{FaultLog, FaultReason, FaultRecord, FaultSink};
use super::precision::round_point;
use super::rate_limiter::RateLimiter;
use super::solver::{SolvedPoint, Solver, SolverConfig};
use super::variable::PowerType;
use crate::domain::device::{DeviceId, DeviceSpec};
use crate::domain::outbound::OutboundChannel;
use crate::domain::snapshot::TelemetrySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    Idle,
    AcceptingConstraints,
    Solving,
    Applying,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Two EQUALS targets closer than this are considered the same
    #[validate(range(min = 0.0))]
    pub equals_tolerance_w: f64,

    /// Slack the solver allows on every half-plane
    #[validate(range(min = 0.0))]
    pub solver_tolerance_w: f64,

    #[validate(range(min = 1, max = 10000))]
    pub max_projection_iterations: usize,

    /// Faults kept in the in-memory history
    #[validate(range(min = 1))]
    pub fault_history: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            equals_tolerance_w: 1.0,
            solver_tolerance_w: 0.5,
            max_projection_iterations: 64,
            fault_history: 100,
        }
    }
}

impl ArbiterConfig {
    pub fn solver_config(&self) -> SolverConfig {
        SolverConfig {
            tolerance_w: self.solver_tolerance_w,
            max_iterations: self.max_projection_iterations,
        }
    }
}

/// What happened to one device in one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOutcome {
    pub device: DeviceId,
    /// Accepted constraints, statics included
    pub constraints: usize,
    /// Solver output before rate limiting; `None` when solving failed
    pub solved: Option<SolvedPoint>,
    /// Values handed to the outbound channel
    pub applied: SolvedPoint,
    pub fault: Option<FaultReason>,
    /// Writes the outbound channel refused
    pub failed_writes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<DeviceOutcome>,
    /// Submissions answered with `Infeasible`
    pub rejected: usize,
    /// Submissions answered with `CycleClosed`
    pub late: usize,
}

impl CycleReport {
    pub fn outcome(&self, device: &DeviceId) -> Option<&DeviceOutcome> {
        self.outcomes.iter().find(|o| &o.device == device)
    }

    pub fn faults(&self) -> impl Iterator<Item = (&DeviceId, &FaultReason)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.fault.as_ref().map(|f| (&o.device, f)))
    }
}

#[derive(Debug)]
struct DeviceSlot {
    spec: DeviceSpec,
    constraints: ConstraintSet,
    static_constraints: Vec<Constraint>,
    envelope: Envelope,
    limiter: RateLimiter,
    soc_percent: Option<f64>,
    last_fault: Option<FaultReason>,
    last_applied: Option<SolvedPoint>,
}

/// Per-cycle arbitration over a fixed registry of devices.
///
/// Driven by a scheduler: [`begin_cycle`](Self::begin_cycle), then
/// controllers call [`submit`](Self::submit) in priority order, then
/// [`end_cycle`](Self::end_cycle) solves every device and writes exactly one
/// value per variable. Devices never share state, a failure on one only
/// zeroes that device.
pub struct Arbiter {
    config: ArbiterConfig,
    solver: Solver,
    devices: BTreeMap<DeviceId, DeviceSlot>,
    state: CycleState,
    cycle: u64,
    started_at: Option<DateTime<Utc>>,
    rejected: usize,
    late: usize,
    faults: FaultLog,
    sinks: Vec<Box<dyn FaultSink>>,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            solver: Solver::new(config.solver_config()),
            faults: FaultLog::new(config.fault_history),
            config,
            devices: BTreeMap::new(),
            state: CycleState::Idle,
            cycle: 0,
            started_at: None,
            rejected: 0,
            late: 0,
            sinks: Vec::new(),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn add_fault_sink(&mut self, sink: Box<dyn FaultSink>) {
        self.sinks.push(sink);
    }

    pub fn register_device(&mut self, spec: DeviceSpec) -> Result<(), PowerError> {
        if self.state != CycleState::Idle {
            return Err(PowerError::NotIdle(self.state));
        }
        if self.devices.contains_key(&spec.id) {
            return Err(PowerError::DuplicateDevice(spec.id));
        }
        let slot = DeviceSlot {
            constraints: ConstraintSet::new(spec.id.clone(), self.config.equals_tolerance_w),
            static_constraints: Vec::new(),
            envelope: Envelope::zero(&spec, DegradeReason::MissingTelemetry),
            limiter: RateLimiter::new(spec.max_step_w),
            soc_percent: None,
            last_fault: None,
            last_applied: None,
            spec,
        };
        debug!(device = %slot.spec.id, kind = %slot.spec.kind, "device registered");
        self.devices.insert(slot.spec.id.clone(), slot);
        Ok(())
    }

    /// Registers an installer limit re-applied at the start of every cycle,
    /// ahead of all controllers.
    pub fn add_static_constraint(
        &mut self,
        device: &DeviceId,
        constraint: Constraint,
    ) -> Result<(), PowerError> {
        if self.state != CycleState::Idle {
            return Err(PowerError::NotIdle(self.state));
        }
        let slot = self
            .devices
            .get_mut(device)
            .ok_or_else(|| PowerError::UnknownDevice(device.clone()))?;

        if !constraint.is_finite() || constraint.variables().any(|v| &v.device != device) {
            return Err(Infeasible::new(
                device.clone(),
                constraint.description(),
                "static constraints must be finite and reference only their own device",
            )
            .into());
        }
        slot.static_constraints
            .extend(constraint.expand(slot.spec.kind));
        Ok(())
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.keys()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Starts a cycle: clears every constraint set, rebuilds envelopes from
    /// the cached telemetry and re-applies static constraints.
    pub fn begin_cycle(&mut self, telemetry: &dyn TelemetrySource, now: DateTime<Utc>) {
        if self.state != CycleState::Idle {
            warn!(cycle = self.cycle, state = %self.state, "previous cycle was not ended, discarding it");
        }
        self.cycle += 1;
        self.started_at = Some(now);
        self.rejected = 0;
        self.late = 0;
        let margin = self.limit_margin();

        for (id, slot) in self.devices.iter_mut() {
            slot.constraints.reset();

            let snapshot = telemetry.read_snapshot(id);
            slot.soc_percent = snapshot.as_ref().and_then(|s| s.soc_percent);
            slot.envelope = Envelope::from_telemetry(&slot.spec, snapshot.as_ref(), now);

            for var in slot.spec.variables() {
                let (min, max) = slot.envelope.variable_limits(&var);
                let inset = margin.min((max - min).max(0.0) / 2.0);
                slot.constraints.set_limits(var, min + inset, max - inset);
            }

            for constraint in &slot.static_constraints {
                if let Err(err) = slot.constraints.validate_and_add(constraint.clone()) {
                    warn!(device = %id, constraint = %constraint.description(), error = %err, "static constraint skipped this cycle");
                }
            }
        }

        self.state = CycleState::AcceptingConstraints;
        debug!(cycle = self.cycle, devices = self.devices.len(), "cycle started");
    }

    /// Inset applied to the physical limits handed to each constraint set.
    /// Pins are accepted up to `equals_tolerance_w` past a limit while the
    /// solver only allows `solver_tolerance_w`, so the limits shrink by the
    /// difference.
    fn limit_margin(&self) -> f64 {
        (self.config.equals_tolerance_w - self.config.solver_tolerance_w).max(0.0)
    }

    /// Controller entry point. A rejected constraint leaves the device's set
    /// untouched; an `ALL` constraint split over three phases is accepted or
    /// rejected as a whole.
    pub fn submit(&mut self, device: &DeviceId, constraint: Constraint) -> Result<(), PowerError> {
        if self.state != CycleState::AcceptingConstraints {
            self.late += 1;
            warn!(device = %device, constraint = %constraint.description(), state = %self.state, "late submission");
            return Err(PowerError::CycleClosed {
                device: device.clone(),
                state: self.state,
            });
        }
        let slot = self
            .devices
            .get_mut(device)
            .ok_or_else(|| PowerError::UnknownDevice(device.clone()))?;

        let checkpoint = slot.constraints.checkpoint();
        for part in constraint.expand(slot.spec.kind) {
            if let Err(err) = slot.constraints.validate_and_add(part) {
                slot.constraints.rollback(checkpoint);
                self.rejected += 1;
                warn!(device = %device, constraint = %constraint.description(), error = %err, "constraint rejected");
                return Err(err.into());
            }
        }
        debug!(device = %device, constraint = %constraint, "constraint accepted");
        Ok(())
    }

    /// Cut-off: later submissions get `CycleClosed`
    pub fn close_submissions(&mut self) {
        if self.state == CycleState::AcceptingConstraints {
            self.state = CycleState::Solving;
            debug!(cycle = self.cycle, "submissions closed");
        }
    }

    /// Solves every device, applies rate limiting, precision and the
    /// envelope clamp, and writes the result. Never aborts: a device that
    /// cannot be solved is written all-zero and faulted.
    pub fn end_cycle(&mut self, outbound: &mut dyn OutboundChannel) -> CycleReport {
        if self.state == CycleState::Idle {
            warn!(cycle = self.cycle, "end_cycle called without an open cycle");
            return self.report(Vec::new());
        }
        self.state = CycleState::Solving;

        let mut planned = Vec::with_capacity(self.devices.len());
        for (id, slot) in self.devices.iter_mut() {
            planned.push(plan_device(&self.solver, id, slot));
        }

        self.state = CycleState::Applying;
        let timestamp = self.started_at.unwrap_or_else(Utc::now);
        let mut outcomes = Vec::with_capacity(planned.len());

        for (solved, applied, fault) in planned {
            let device = applied.device().clone();
            let mut failed_writes = 0;
            for (var, value) in applied.iter() {
                match outbound.write(&device, var.phase, var.power_type, value) {
                    Ok(()) => debug!(device = %device, variable = %var, value_w = value, "set-point written"),
                    Err(err) => {
                        failed_writes += 1;
                        error!(device = %device, variable = %var, value_w = value, error = %err, "set-point write failed");
                    }
                }
            }

            if let Some(fault) = &fault {
                warn!(cycle = self.cycle, device = %device, fault = %fault, "device fault");
                self.faults.record(FaultRecord {
                    timestamp,
                    cycle: self.cycle,
                    device: device.clone(),
                    reason: fault.clone(),
                });
                for sink in self.sinks.iter_mut() {
                    sink.raise(&device, fault);
                }
            }

            let constraints = match self.devices.get_mut(&device) {
                Some(slot) => {
                    slot.limiter.record(&applied);
                    slot.last_applied = Some(applied.clone());
                    slot.last_fault = fault.clone();
                    slot.constraints.len()
                }
                None => 0,
            };

            outcomes.push(DeviceOutcome {
                device,
                constraints,
                solved,
                applied,
                fault,
                failed_writes,
            });
        }

        self.state = CycleState::Idle;
        self.report(outcomes)
    }

    fn report(&self, outcomes: Vec<DeviceOutcome>) -> CycleReport {
        CycleReport {
            cycle: self.cycle,
            started_at: self.started_at,
            outcomes,
            rejected: self.rejected,
            late: self.late,
        }
    }

    /// Fault raised for the device in the last completed cycle
    pub fn last_fault(&self, device: &DeviceId) -> Option<FaultReason> {
        self.devices.get(device).and_then(|s| s.last_fault.clone())
    }

    pub fn fault_history(&self) -> &FaultLog {
        &self.faults
    }

    /// Total power of one type still reachable on the device this cycle
    pub fn power_range(
        &self,
        device: &DeviceId,
        power_type: PowerType,
    ) -> Result<(f64, f64), PowerError> {
        let slot = self
            .devices
            .get(device)
            .ok_or_else(|| PowerError::UnknownDevice(device.clone()))?;
        Ok(self
            .solver
            .power_range(&slot.constraints, &slot.envelope, power_type))
    }

    pub fn constraints(&self, device: &DeviceId) -> Option<&ConstraintSet> {
        self.devices.get(device).map(|s| &s.constraints)
    }

    pub fn envelope(&self, device: &DeviceId) -> Option<&Envelope> {
        self.devices.get(device).map(|s| &s.envelope)
    }

    pub fn spec(&self, device: &DeviceId) -> Option<&DeviceSpec> {
        self.devices.get(device).map(|s| &s.spec)
    }

    /// Values written to the device in the last completed cycle
    pub fn last_applied(&self, device: &DeviceId) -> Option<&SolvedPoint> {
        self.devices.get(device).and_then(|s| s.last_applied.as_ref())
    }
}

/// Solver output, the point to write, and the fault to raise
fn plan_device(
    solver: &Solver,
    id: &DeviceId,
    slot: &mut DeviceSlot,
) -> (Option<SolvedPoint>, SolvedPoint, Option<FaultReason>) {
    match solver.solve(&slot.constraints, &slot.envelope) {
        Ok(solved) => {
            let limited = slot.limiter.limit_point(&solved);
            let rounded = match slot.spec.power_precision_w {
                Some(precision) => round_point(&limited, precision, slot.soc_percent, |var| {
                    slot.limiter.window(var)
                }),
                None => limited,
            };
            let applied = slot.envelope.clamp(&rounded);
            let fault = slot
                .envelope
                .degraded()
                .map(|reason| FaultReason::EnvelopeDegraded { reason });
            (Some(solved), applied, fault)
        }
        Err(err) => {
            slot.limiter.reset();
            (
                None,
                SolvedPoint::zero(id.clone(), slot.spec.variables()),
                Some(FaultReason::from_error(&err)),
            )
        }
    }
}
