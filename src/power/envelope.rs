use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use strum::Display;
use tracing::warn;

use super::constraint::{Coefficient, Constraint, Relationship};
use super::solver::SolvedPoint;
use super::variable::{Phase, PowerType, Variable};
use crate::domain::device::{DeviceId, DeviceKind, DeviceSpec};
use crate::domain::snapshot::TelemetrySnapshot;

/// Fewest facets used for the apparent-power polygon.
pub const MIN_FACETS: usize = 8;

/// Facet normals shorter than this are treated as axis-aligned.
const NORMAL_EPSILON: f64 = 1e-12;

/// Why an envelope was collapsed to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    #[strum(to_string = "telemetry missing")]
    MissingTelemetry,
    #[strum(to_string = "telemetry stale")]
    StaleTelemetry,
    #[strum(to_string = "state of charge unknown")]
    MissingSoc,
    #[strum(to_string = "rated limits invalid")]
    InvalidRatedLimits,
    #[strum(to_string = "temperature out of range")]
    TemperatureOutOfRange,
}

/// Limits that apply to one controllable phase of a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseLimits {
    pub min_active_w: f64,
    pub max_active_w: f64,
    pub min_reactive_var: f64,
    pub max_reactive_var: f64,
    pub max_apparent_va: f64,
}

/// Feasible region of one device for the current cycle.
///
/// Box limits on P and Q plus an inscribed regular polygon approximating
/// `P² + Q² <= S²`. Built from telemetry every cycle; anything unusable
/// collapses it to the single point zero (safe mode).
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    device: DeviceId,
    kind: DeviceKind,
    min_active_w: f64,
    max_active_w: f64,
    min_reactive_var: f64,
    max_reactive_var: f64,
    max_apparent_va: f64,
    facets: usize,
    degraded: Option<DegradeReason>,
}

impl Envelope {
    /// Never fails: unusable telemetry yields [`Envelope::zero`].
    pub fn from_telemetry(
        spec: &DeviceSpec,
        snapshot: Option<&TelemetrySnapshot>,
        now: DateTime<Utc>,
    ) -> Self {
        match Self::try_from_telemetry(spec, snapshot, now) {
            Ok(envelope) => envelope,
            Err(reason) => {
                warn!(device = %spec.id, reason = %reason, "capacity envelope collapsed to zero");
                Self::zero(spec, reason)
            }
        }
    }

    fn try_from_telemetry(
        spec: &DeviceSpec,
        snapshot: Option<&TelemetrySnapshot>,
        now: DateTime<Utc>,
    ) -> Result<Self, DegradeReason> {
        let snapshot = snapshot.ok_or(DegradeReason::MissingTelemetry)?;

        let max_age = Duration::seconds(spec.max_telemetry_age_secs as i64);
        if snapshot.age(now) > max_age {
            return Err(DegradeReason::StaleTelemetry);
        }

        let soc = snapshot
            .soc_percent
            .filter(|soc| soc.is_finite())
            .ok_or(DegradeReason::MissingSoc)?;

        let rated = &snapshot.rated;
        if !rated.is_valid() {
            return Err(DegradeReason::InvalidRatedLimits);
        }

        if let Some(temperature) = snapshot.temperature_c {
            if !temperature.is_finite()
                || temperature < spec.min_temperature_c
                || temperature > spec.max_temperature_c
            {
                return Err(DegradeReason::TemperatureOutOfRange);
            }
        }

        let apparent = rated.max_apparent_va;
        let mut max_active = rated.max_discharge_w.min(apparent);
        let mut min_active = -rated.max_charge_w.min(apparent);
        if soc <= spec.min_soc_percent {
            max_active = 0.0;
        }
        if soc >= spec.max_soc_percent {
            min_active = 0.0;
        }
        let reactive = rated.max_reactive_var.min(apparent);

        Ok(Self {
            device: spec.id.clone(),
            kind: spec.kind,
            min_active_w: min_active,
            max_active_w: max_active,
            min_reactive_var: -reactive,
            max_reactive_var: reactive,
            max_apparent_va: apparent,
            facets: spec.facets.max(MIN_FACETS),
            degraded: None,
        })
    }

    /// Safe-mode envelope: the only feasible point is zero
    pub fn zero(spec: &DeviceSpec, reason: DegradeReason) -> Self {
        Self {
            device: spec.id.clone(),
            kind: spec.kind,
            min_active_w: 0.0,
            max_active_w: 0.0,
            min_reactive_var: 0.0,
            max_reactive_var: 0.0,
            max_apparent_va: 0.0,
            facets: spec.facets.max(MIN_FACETS),
            degraded: Some(reason),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn min_active_w(&self) -> f64 {
        self.min_active_w
    }

    pub fn max_active_w(&self) -> f64 {
        self.max_active_w
    }

    pub fn min_reactive_var(&self) -> f64 {
        self.min_reactive_var
    }

    pub fn max_reactive_var(&self) -> f64 {
        self.max_reactive_var
    }

    pub fn max_apparent_va(&self) -> f64 {
        self.max_apparent_va
    }

    pub fn facets(&self) -> usize {
        self.facets
    }

    pub fn degraded(&self) -> Option<DegradeReason> {
        self.degraded
    }

    pub fn variables(&self) -> Vec<Variable> {
        self.kind.variables(&self.device)
    }

    /// Device limits divided evenly over the controllable phases
    pub fn phase_limits(&self) -> PhaseLimits {
        let n = self.kind.phase_count();
        PhaseLimits {
            min_active_w: self.min_active_w / n,
            max_active_w: self.max_active_w / n,
            min_reactive_var: self.min_reactive_var / n,
            max_reactive_var: self.max_reactive_var / n,
            max_apparent_va: self.max_apparent_va / n,
        }
    }

    pub fn box_limits(&self, variable: &Variable) -> (f64, f64) {
        let limits = self.phase_limits();
        match variable.power_type {
            PowerType::Active => (limits.min_active_w, limits.max_active_w),
            PowerType::Reactive => (limits.min_reactive_var, limits.max_reactive_var),
        }
    }

    /// Box limits of a variable cut to the polygon's axis extent. A pin
    /// inside this range satisfies every facet while the other axis is zero.
    pub fn variable_limits(&self, variable: &Variable) -> (f64, f64) {
        let (lo, hi) = self.box_limits(variable);
        let extent = self.axis_extent();
        (lo.max(-extent), hi.min(extent))
    }

    /// Largest |P| or |Q| reachable along either axis without leaving the
    /// polygon, per phase
    pub fn axis_extent(&self) -> f64 {
        self.phase_limits().max_apparent_va * (PI / self.facets as f64).cos()
    }

    /// Facets of the polygon as `cos θ·P + sin θ·Q <= r·cos(π/n)` per phase
    pub fn half_planes(&self) -> Vec<Constraint> {
        let n = self.facets;
        let offset = self.axis_extent();

        self.kind
            .phases()
            .iter()
            .flat_map(|phase| {
                (0..n).map(move |k| {
                    let theta = 2.0 * PI * k as f64 / n as f64;
                    self.facet(*phase, k, theta, offset)
                })
            })
            .collect()
    }

    fn facet(&self, phase: Phase, k: usize, theta: f64, offset: f64) -> Constraint {
        let mut coefficients = Vec::with_capacity(2);
        let (cos, sin) = (theta.cos(), theta.sin());
        if cos.abs() > NORMAL_EPSILON {
            coefficients.push(Coefficient::new(
                Variable::active(self.device.clone(), phase),
                cos,
            ));
        }
        if sin.abs() > NORMAL_EPSILON {
            coefficients.push(Coefficient::new(
                Variable::reactive(self.device.clone(), phase),
                sin,
            ));
        }
        Constraint::new(
            format!("{} facet {}/{} {}", self.device, k, self.facets, phase),
            coefficients,
            Relationship::LessOrEquals,
            offset,
        )
    }

    pub fn contains(&self, point: &SolvedPoint, tolerance: f64) -> bool {
        let in_box = self.variables().iter().all(|var| {
            let (lo, hi) = self.box_limits(var);
            let value = point.get(var);
            value >= lo - tolerance && value <= hi + tolerance
        });
        in_box
            && self
                .half_planes()
                .iter()
                .all(|facet| facet.is_satisfied_by(|v| point.get(v), tolerance))
    }

    /// Pulls a point into the envelope: box clamp first, then a radial
    /// scale towards zero per phase until every facet holds.
    pub fn clamp(&self, point: &SolvedPoint) -> SolvedPoint {
        let mut clamped = SolvedPoint::new(self.device.clone());
        for var in self.variables() {
            let (lo, hi) = self.box_limits(&var);
            clamped.set(var.clone(), point.get(&var).max(lo).min(hi));
        }

        let offset = self.axis_extent();
        let n = self.facets;
        for phase in self.kind.phases() {
            let p_var = Variable::active(self.device.clone(), *phase);
            let q_var = Variable::reactive(self.device.clone(), *phase);
            let (p, q) = (clamped.get(&p_var), clamped.get(&q_var));

            let scale = (0..n)
                .map(|k| {
                    let theta = 2.0 * PI * k as f64 / n as f64;
                    theta.cos() * p + theta.sin() * q
                })
                .filter(|lhs| *lhs > offset)
                .fold(1.0_f64, |scale, lhs| scale.min(offset / lhs));

            if scale < 1.0 {
                clamped.set(p_var, p * scale);
                clamped.set(q_var, q * scale);
            }
        }
        clamped
    }
}
