use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use validator::Validate;

use crate::controller::{CycleConfig, SetpointConfig};
use crate::domain::device::{DeviceId, DeviceSpec};
use crate::domain::snapshot::RatedLimits;
use crate::power::ArbiterConfig;

/// Environment variables with this prefix override the file,
/// e.g. `ARBITER__CYCLE__PERIOD_MS=500`.
pub const ENV_PREFIX: &str = "ARBITER__";

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub controllers: Vec<SetpointConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub devices: Vec<SimulatedDeviceConfig>,
}

/// Physical parameters of one simulated ESS
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SimulatedDeviceConfig {
    pub id: DeviceId,

    #[validate(range(min = 100.0))]
    pub capacity_wh: f64,

    #[serde(default = "default_initial_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub initial_soc_percent: f64,

    #[serde(default = "default_ambient")]
    #[validate(range(min = -40.0, max = 60.0))]
    pub ambient_temp_c: f64,

    /// Round-trip share of energy kept, applied on both charge and discharge
    #[serde(default = "default_efficiency")]
    #[validate(range(min = 0.5, max = 1.0))]
    pub efficiency: f64,

    pub rated: RatedLimits,
}

fn default_initial_soc() -> f64 {
    50.0
}

fn default_ambient() -> f64 {
    20.0
}

fn default_efficiency() -> f64 {
    0.95
}

impl Config {
    /// Loads `config/default.toml` plus `ARBITER__*` overrides
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let config: Config = figment
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without consulting the environment
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cycle.validate().context("invalid [cycle] section")?;
        if self.cycle.deadline_ms >= self.cycle.period_ms {
            bail!(
                "cycle.deadline_ms ({}) must be shorter than cycle.period_ms ({})",
                self.cycle.deadline_ms,
                self.cycle.period_ms
            );
        }
        self.arbiter.validate().context("invalid [arbiter] section")?;

        if self.devices.is_empty() {
            bail!("at least one device must be configured");
        }
        let mut ids = BTreeSet::new();
        for device in &self.devices {
            device
                .validate()
                .with_context(|| format!("invalid device '{}'", device.id))?;
            if let Err(reason) = device.check_consistency() {
                bail!(reason);
            }
            if !ids.insert(&device.id) {
                bail!("device '{}' is configured twice", device.id);
            }
        }

        let mut controller_ids = BTreeSet::new();
        for controller in &self.controllers {
            controller
                .validate()
                .with_context(|| format!("invalid controller '{}'", controller.id))?;
            if !controller.target_w.is_finite() {
                bail!("controller '{}' has a non-finite target", controller.id);
            }
            if !ids.contains(&controller.device) {
                bail!(
                    "controller '{}' references unknown device '{}'",
                    controller.id,
                    controller.device
                );
            }
            if !controller_ids.insert(controller.id.as_str()) {
                bail!("controller '{}' is configured twice", controller.id);
            }
        }

        for sim in &self.simulation.devices {
            sim.validate()
                .with_context(|| format!("invalid simulated device '{}'", sim.id))?;
            if !sim.rated.is_valid() {
                bail!("simulated device '{}' has invalid rated limits", sim.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::DeviceKind;
    use crate::power::{Phase, Relationship};

    const SAMPLE: &str = r#"
        [cycle]
        period_ms = 500
        deadline_ms = 50

        [[devices]]
        id = "ess0"
        max_step_w = 1000.0

        [[devices]]
        id = "ess1"
        kind = "asymmetric"
        power_precision_w = 10.0

        [[controllers]]
        id = "peak-shaving"
        device = "ess0"
        relationship = "LESS_OR_EQUALS"
        target_w = 3000.0

        [[controllers]]
        id = "balancing"
        device = "ess1"
        phase = "L2"
        relationship = "EQUALS"
        target_w = -500.0
        clip_on_conflict = true

        [[simulation.devices]]
        id = "ess0"
        capacity_wh = 10000.0
        rated = { max_apparent_va = 5000.0, max_charge_w = 5000.0, max_discharge_w = 5000.0, max_reactive_var = 3000.0 }
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.cycle.period_ms, 500);
        assert_eq!(config.arbiter.equals_tolerance_w, 1.0);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].kind, DeviceKind::Symmetric);
        assert_eq!(config.devices[0].facets, 8);
        assert_eq!(config.devices[1].kind, DeviceKind::Asymmetric);
        assert_eq!(config.controllers[0].phase, Phase::All);
        assert_eq!(config.controllers[1].relationship, Relationship::Equals);
        assert_eq!(config.simulation.devices[0].initial_soc_percent, 50.0);
    }

    #[test]
    fn test_rejects_unknown_device_reference() {
        let toml = r#"
            [[devices]]
            id = "ess0"

            [[controllers]]
            id = "c"
            device = "ess7"
            relationship = "EQUALS"
            target_w = 0.0
        "#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("ess7"));
    }

    #[test]
    fn test_rejects_duplicate_devices() {
        let toml = r#"
            [[devices]]
            id = "ess0"

            [[devices]]
            id = "ess0"
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let toml = r#"
            [[devices]]
            id = "ess0"
            min_soc_percent = 150.0
        "#;
        assert!(Config::from_toml_str(toml).is_err());

        let toml = r#"
            [cycle]
            period_ms = 100
            deadline_ms = 200

            [[devices]]
            id = "ess0"
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "arbiter.toml",
                r#"
                    [[devices]]
                    id = "ess0"
                "#,
            )?;
            jail.set_env("ARBITER__CYCLE__PERIOD_MS", "250");
            let config = Config::load_from("arbiter.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.cycle.period_ms, 250);
            Ok(())
        });
    }
}
