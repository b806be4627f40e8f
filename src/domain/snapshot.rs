use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::device::DeviceId;

/// Nameplate limits reported by the inverter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatedLimits {
    /// Maximum apparent power S (VA)
    pub max_apparent_va: f64,
    /// Maximum charge power (W, positive number)
    pub max_charge_w: f64,
    /// Maximum discharge power (W, positive number)
    pub max_discharge_w: f64,
    /// Maximum reactive power in either direction (var)
    pub max_reactive_var: f64,
}

impl RatedLimits {
    /// Limits where every axis is bounded by the apparent power alone
    pub fn symmetric(max_apparent_va: f64) -> Self {
        Self {
            max_apparent_va,
            max_charge_w: max_apparent_va,
            max_discharge_w: max_apparent_va,
            max_reactive_var: max_apparent_va,
        }
    }

    pub fn is_valid(&self) -> bool {
        [
            self.max_apparent_va,
            self.max_charge_w,
            self.max_discharge_w,
            self.max_reactive_var,
        ]
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// Device state as sampled before a cycle begins.
///
/// Sign convention follows the set-points: positive active power discharges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// State of charge (%); `None` when the device did not report it
    pub soc_percent: Option<f64>,

    /// Cell temperature; optional, only checked when present
    pub temperature_c: Option<f64>,

    pub rated: RatedLimits,

    pub measured_active_w: f64,

    pub measured_reactive_var: f64,

    /// Time the sample was taken, not the time it was read
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySnapshot {
    pub fn new(soc_percent: f64, rated: RatedLimits, timestamp: DateTime<Utc>) -> Self {
        Self {
            soc_percent: Some(soc_percent),
            temperature_c: None,
            rated,
            measured_active_w: 0.0,
            measured_reactive_var: 0.0,
            timestamp,
        }
    }

    pub fn new_now(soc_percent: f64, rated: RatedLimits) -> Self {
        Self::new(soc_percent, rated, Utc::now())
    }

    pub fn with_temperature(mut self, temperature_c: f64) -> Self {
        self.temperature_c = Some(temperature_c);
        self
    }

    pub fn with_measured(mut self, active_w: f64, reactive_var: f64) -> Self {
        self.measured_active_w = active_w;
        self.measured_reactive_var = reactive_var;
        self
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.timestamp)
    }
}

/// Read side of the device link. Implementations return whatever was last
/// sampled; `None` means nothing usable is known about the device.
pub trait TelemetrySource {
    fn read_snapshot(&self, device: &DeviceId) -> Option<TelemetrySnapshot>;
}

/// In-memory snapshot store, refreshed by whatever polls the devices.
#[derive(Debug, Clone, Default)]
pub struct TelemetryCache {
    snapshots: BTreeMap<DeviceId, TelemetrySnapshot>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, device: DeviceId, snapshot: TelemetrySnapshot) {
        self.snapshots.insert(device, snapshot);
    }

    pub fn remove(&mut self, device: &DeviceId) -> Option<TelemetrySnapshot> {
        self.snapshots.remove(device)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl TelemetrySource for TelemetryCache {
    fn read_snapshot(&self, device: &DeviceId) -> Option<TelemetrySnapshot> {
        self.snapshots.get(device).cloned()
    }
}
