use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::SimulatedDeviceConfig;
use crate::domain::device::DeviceId;
use crate::domain::snapshot::{RatedLimits, TelemetrySnapshot};
use crate::power::{Phase, PowerType};

/// Lumped thermal mass of a home battery (J/K)
const THERMAL_CAPACITY_J_PER_K: f64 = 75.0 * 1100.0;

/// Heat transfer to ambient (W/K)
const HEAT_TRANSFER_W_PER_K: f64 = 15.0;

/// Conversion losses at rated power, as a share of the power
const LOSS_AT_RATED: f64 = 0.03;

/// One simulated inverter with battery.
///
/// Positive active power discharges. Energy leaves the cells at
/// `P / efficiency` while discharging and enters at `|P| · efficiency`
/// while charging.
#[derive(Debug, Clone)]
pub struct SimulatedEss {
    id: DeviceId,
    capacity_wh: f64,
    soc_percent: f64,
    temperature_c: f64,
    ambient_temp_c: f64,
    efficiency: f64,
    rated: RatedLimits,
    setpoints: BTreeMap<(Phase, PowerType), f64>,
}

impl SimulatedEss {
    pub fn new(config: &SimulatedDeviceConfig) -> Result<Self> {
        if !(0.5..=1.0).contains(&config.efficiency) {
            bail!(
                "Invalid battery efficiency: {}. Must be between 0.5 and 1.0",
                config.efficiency
            );
        }
        if config.capacity_wh <= 0.0 || !config.rated.is_valid() {
            bail!("simulated device '{}' has invalid capacity or rated limits", config.id);
        }
        Ok(Self {
            id: config.id.clone(),
            capacity_wh: config.capacity_wh,
            soc_percent: config.initial_soc_percent.clamp(0.0, 100.0),
            temperature_c: config.ambient_temp_c,
            ambient_temp_c: config.ambient_temp_c,
            efficiency: config.efficiency,
            rated: config.rated,
            setpoints: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn soc_percent(&self) -> f64 {
        self.soc_percent
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    /// Accepts a set-point; an inverter accepts anything and enforces its
    /// own ratings, so the value is limited here the same way
    pub fn set_point(&mut self, phase: Phase, power_type: PowerType, value: f64) {
        let apparent = self.rated.max_apparent_va;
        let (min, max) = match power_type {
            PowerType::Active => (
                -self.rated.max_charge_w.min(apparent),
                self.rated.max_discharge_w.min(apparent),
            ),
            PowerType::Reactive => {
                let q = self.rated.max_reactive_var.min(apparent);
                (-q, q)
            }
        };
        let value = if value.is_finite() { value.max(min).min(max) } else { 0.0 };
        self.setpoints.insert((phase, power_type), value);
    }

    pub fn active_w(&self) -> f64 {
        self.total(PowerType::Active)
    }

    pub fn reactive_var(&self) -> f64 {
        self.total(PowerType::Reactive)
    }

    fn total(&self, power_type: PowerType) -> f64 {
        self.setpoints
            .iter()
            .filter(|((_, t), _)| *t == power_type)
            .map(|(_, v)| v)
            .sum()
    }

    /// Integrates the current set-points over `dt`
    pub fn step(&mut self, dt: Duration) {
        let dt_s = dt.as_secs_f64();
        if dt_s <= 0.0 {
            return;
        }

        let mut active = self.active_w();
        if (active > 0.0 && self.soc_percent <= 0.0) || (active < 0.0 && self.soc_percent >= 100.0) {
            active = 0.0;
        }

        let dt_h = dt_s / 3600.0;
        let delta_wh = if active >= 0.0 {
            -active * dt_h / self.efficiency
        } else {
            -active * dt_h * self.efficiency
        };
        self.soc_percent = (self.soc_percent + delta_wh / self.capacity_wh * 100.0).clamp(0.0, 100.0);

        let apparent = active.hypot(self.reactive_var());
        let load = if self.rated.max_apparent_va > 0.0 {
            apparent / self.rated.max_apparent_va
        } else {
            0.0
        };
        let heat_w = LOSS_AT_RATED * apparent * load;
        let dissipation_w = HEAT_TRANSFER_W_PER_K * (self.temperature_c - self.ambient_temp_c);
        self.temperature_c += (heat_w - dissipation_w) * dt_s / THERMAL_CAPACITY_J_PER_K;
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> TelemetrySnapshot {
        TelemetrySnapshot::new(self.soc_percent, self.rated, now)
            .with_temperature(self.temperature_c)
            .with_measured(self.active_w(), self.reactive_var())
    }
}
