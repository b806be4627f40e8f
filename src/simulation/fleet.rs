use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::ess::SimulatedEss;
use crate::config::SimulationConfig;
use crate::controller::DeviceBridge;
use crate::domain::device::DeviceId;
use crate::domain::outbound::OutboundChannel;
use crate::domain::snapshot::TelemetryCache;
use crate::power::{Phase, PowerType};

/// All simulated devices, acting as both telemetry source and outbound
/// channel of the control loop.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFleet {
    devices: BTreeMap<DeviceId, SimulatedEss>,
    last_poll: Option<DateTime<Utc>>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        let mut fleet = Self::new();
        for device in &config.devices {
            fleet.insert(SimulatedEss::new(device)?);
        }
        Ok(fleet)
    }

    pub fn insert(&mut self, ess: SimulatedEss) {
        self.devices.insert(ess.id().clone(), ess);
    }

    pub fn device(&self, id: &DeviceId) -> Option<&SimulatedEss> {
        self.devices.get(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn step(&mut self, dt: Duration) {
        for ess in self.devices.values_mut() {
            ess.step(dt);
        }
    }

    pub fn telemetry(&self, now: DateTime<Utc>) -> TelemetryCache {
        let mut cache = TelemetryCache::new();
        for (id, ess) in &self.devices {
            cache.update(id.clone(), ess.snapshot(now));
        }
        cache
    }
}

impl OutboundChannel for SimulatedFleet {
    fn write(
        &mut self,
        device: &DeviceId,
        phase: Phase,
        power_type: PowerType,
        value: f64,
    ) -> Result<()> {
        let ess = self
            .devices
            .get_mut(device)
            .ok_or_else(|| anyhow!("no simulated device '{device}'"))?;
        ess.set_point(phase, power_type, value);
        Ok(())
    }
}

impl DeviceBridge for SimulatedFleet {
    /// Advances the simulation by the time since the previous poll
    fn poll(&mut self, now: DateTime<Utc>) -> TelemetryCache {
        if let Some(last) = self.last_poll {
            let dt = now.signed_duration_since(last).to_std().unwrap_or_default();
            self.step(dt);
            debug!(elapsed_ms = dt.as_millis() as u64, devices = self.devices.len(), "simulation advanced");
        }
        self.last_poll = Some(now);
        self.telemetry(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatedDeviceConfig;
    use crate::domain::snapshot::{RatedLimits, TelemetrySource};

    fn fleet() -> SimulatedFleet {
        SimulatedFleet::from_config(&SimulationConfig {
            devices: vec![SimulatedDeviceConfig {
                id: "ess0".into(),
                capacity_wh: 3600.0,
                initial_soc_percent: 50.0,
                ambient_temp_c: 20.0,
                efficiency: 1.0,
                rated: RatedLimits::symmetric(5000.0),
            }],
        })
        .unwrap()
    }

    #[test]
    fn test_write_unknown_device_fails() {
        let mut fleet = fleet();
        assert!(fleet
            .write(&"ess9".into(), Phase::All, PowerType::Active, 1.0)
            .is_err());
    }

    #[test]
    fn test_poll_integrates_elapsed_time() {
        let mut fleet = fleet();
        let t0 = Utc::now();
        let cache = fleet.poll(t0);
        assert_eq!(cache.read_snapshot(&"ess0".into()).unwrap().soc_percent, Some(50.0));

        fleet.write(&"ess0".into(), Phase::All, PowerType::Active, 360.0).unwrap();
        let cache = fleet.poll(t0 + chrono::Duration::seconds(100));
        // 360 W for 100 s is 10 Wh, 10 / 3600 of capacity
        let soc = cache.read_snapshot(&"ess0".into()).unwrap().soc_percent.unwrap();
        assert!((soc - (50.0 - 1000.0 / 3600.0)).abs() < 1e-9);
    }
}
