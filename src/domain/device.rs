use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};
use validator::Validate;

use crate::power::variable::{Phase, PowerType, Variable};

/// Stable identifier of a managed energy storage system, e.g. `ess0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a device controls its phases jointly or one by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
    /// One set-point shared by all three phases (`ALL` variables only)
    #[default]
    Symmetric,
    /// Independent L1/L2/L3 set-points
    Asymmetric,
}

impl DeviceKind {
    /// Phases that carry decision variables for this kind of device
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            DeviceKind::Symmetric => &[Phase::All],
            DeviceKind::Asymmetric => &[Phase::L1, Phase::L2, Phase::L3],
        }
    }

    /// Number of phases the rated capacity is shared between
    pub fn phase_count(&self) -> f64 {
        self.phases().len() as f64
    }

    /// Decision variables of a device, ordered deterministically
    pub fn variables(&self, device: &DeviceId) -> Vec<Variable> {
        self.phases()
            .iter()
            .flat_map(|phase| {
                [PowerType::Active, PowerType::Reactive]
                    .into_iter()
                    .map(move |power_type| Variable::new(device.clone(), *phase, power_type))
            })
            .collect()
    }
}

/// Static policy of one device. Rated limits come from telemetry, everything
/// here is configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeviceSpec {
    pub id: DeviceId,

    #[serde(default)]
    pub kind: DeviceKind,

    /// At or below this SOC discharging is blocked
    #[serde(default = "default_min_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percent: f64,

    /// At or above this SOC charging is blocked
    #[serde(default = "default_max_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_percent: f64,

    #[serde(default = "default_min_temperature")]
    #[validate(range(min = -60.0, max = 100.0))]
    pub min_temperature_c: f64,

    #[serde(default = "default_max_temperature")]
    #[validate(range(min = -60.0, max = 100.0))]
    pub max_temperature_c: f64,

    /// Telemetry older than this collapses the envelope to zero
    #[serde(default = "default_max_telemetry_age")]
    #[validate(range(min = 1))]
    pub max_telemetry_age_secs: u64,

    /// Polygon facets approximating the apparent-power circle
    #[serde(default = "default_facets")]
    #[validate(range(min = 8, max = 360))]
    pub facets: usize,

    /// Largest per-cycle change of any variable; unlimited when absent
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub max_step_w: Option<f64>,

    /// Inverter set-point resolution; no rounding when absent
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub power_precision_w: Option<f64>,
}

fn default_min_soc() -> f64 {
    5.0
}

fn default_max_soc() -> f64 {
    98.0
}

fn default_min_temperature() -> f64 {
    -10.0
}

fn default_max_temperature() -> f64 {
    60.0
}

fn default_max_telemetry_age() -> u64 {
    10
}

fn default_facets() -> usize {
    8
}

impl DeviceSpec {
    pub fn new(id: impl Into<DeviceId>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            min_soc_percent: default_min_soc(),
            max_soc_percent: default_max_soc(),
            min_temperature_c: default_min_temperature(),
            max_temperature_c: default_max_temperature(),
            max_telemetry_age_secs: default_max_telemetry_age(),
            facets: default_facets(),
            max_step_w: None,
            power_precision_w: None,
        }
    }

    pub fn symmetric(id: impl Into<DeviceId>) -> Self {
        Self::new(id, DeviceKind::Symmetric)
    }

    pub fn asymmetric(id: impl Into<DeviceId>) -> Self {
        Self::new(id, DeviceKind::Asymmetric)
    }

    pub fn with_max_step(mut self, max_step_w: f64) -> Self {
        self.max_step_w = Some(max_step_w);
        self
    }

    pub fn with_precision(mut self, precision_w: f64) -> Self {
        self.power_precision_w = Some(precision_w);
        self
    }

    pub fn with_facets(mut self, facets: usize) -> Self {
        self.facets = facets;
        self
    }

    pub fn with_soc_window(mut self, min_soc_percent: f64, max_soc_percent: f64) -> Self {
        self.min_soc_percent = min_soc_percent;
        self.max_soc_percent = max_soc_percent;
        self
    }

    pub fn variables(&self) -> Vec<Variable> {
        self.kind.variables(&self.id)
    }

    /// Checks that cannot be expressed as per-field ranges
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("device id must not be empty".to_string());
        }
        if self.min_soc_percent >= self.max_soc_percent {
            return Err(format!(
                "{}: min_soc_percent ({}) must be below max_soc_percent ({})",
                self.id, self.min_soc_percent, self.max_soc_percent
            ));
        }
        if self.min_temperature_c >= self.max_temperature_c {
            return Err(format!(
                "{}: min_temperature_c ({}) must be below max_temperature_c ({})",
                self.id, self.min_temperature_c, self.max_temperature_c
            ));
        }
        Ok(())
    }
}
