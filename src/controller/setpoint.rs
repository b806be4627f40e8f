use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use validator::Validate;

use super::Controller;
use crate::domain::device::DeviceId;
use crate::power::{Arbiter, Constraint, Phase, PowerError, PowerType, Relationship, Variable};

fn default_phase() -> Phase {
    Phase::All
}

/// A controller that asks for the same thing every cycle, e.g. an
/// installer-configured charge limit or a fixed discharge schedule slot.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SetpointConfig {
    #[validate(length(min = 1))]
    pub id: String,

    pub device: DeviceId,

    #[serde(default = "default_phase")]
    pub phase: Phase,

    #[serde(default)]
    pub power_type: PowerType,

    pub relationship: Relationship,

    pub target_w: f64,

    /// On conflict, retry with the target clipped into what is still
    /// reachable instead of skipping the cycle
    #[serde(default)]
    pub clip_on_conflict: bool,
}

pub struct SetpointController {
    config: SetpointConfig,
}

impl SetpointController {
    pub fn new(config: SetpointConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SetpointConfig {
        &self.config
    }

    fn constraint(&self, target: f64, suffix: &str) -> Constraint {
        let variable = Variable::new(
            self.config.device.clone(),
            self.config.phase,
            self.config.power_type,
        );
        Constraint::simple(
            format!("{}{}", self.config.id, suffix),
            variable,
            self.config.relationship,
            target,
        )
    }

    /// Clipping needs the total range, which only matches an `ALL` target
    fn clip(&self, arbiter: &mut Arbiter) -> Result<()> {
        let (min, max) = arbiter.power_range(&self.config.device, self.config.power_type)?;
        let clipped = self.config.target_w.max(min).min(max);
        debug!(
            controller = %self.config.id,
            target_w = self.config.target_w,
            clipped_w = clipped,
            "retrying with clipped target"
        );
        arbiter.submit(&self.config.device, self.constraint(clipped, " (clipped)"))?;
        Ok(())
    }
}

impl Controller for SetpointController {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn run(&mut self, arbiter: &mut Arbiter) -> Result<()> {
        match arbiter.submit(&self.config.device, self.constraint(self.config.target_w, "")) {
            Ok(()) => Ok(()),
            Err(PowerError::Infeasible(err))
                if self.config.clip_on_conflict && self.config.phase == Phase::All =>
            {
                debug!(controller = %self.config.id, error = %err, "set-point conflicts");
                if let Err(e) = self.clip(arbiter) {
                    warn!(controller = %self.config.id, error = %e, "clipped set-point rejected too, skipping this cycle");
                }
                Ok(())
            }
            Err(PowerError::Infeasible(err)) => {
                warn!(controller = %self.config.id, error = %err, "set-point rejected, skipping this cycle");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::DeviceSpec;
    use crate::domain::snapshot::{RatedLimits, TelemetryCache, TelemetrySnapshot};
    use crate::power::ArbiterConfig;
    use chrono::Utc;

    fn config(id: &str, relationship: Relationship, target_w: f64, clip: bool) -> SetpointConfig {
        SetpointConfig {
            id: id.to_string(),
            device: "ess0".into(),
            phase: Phase::All,
            power_type: PowerType::Active,
            relationship,
            target_w,
            clip_on_conflict: clip,
        }
    }

    fn open_cycle() -> Arbiter {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        arbiter.register_device(DeviceSpec::symmetric("ess0")).unwrap();
        let mut cache = TelemetryCache::new();
        cache.update(
            "ess0".into(),
            TelemetrySnapshot::new_now(50.0, RatedLimits::symmetric(10_000.0)),
        );
        arbiter.begin_cycle(&cache, Utc::now());
        arbiter
    }

    #[test]
    fn test_conflict_is_skipped() {
        let mut arbiter = open_cycle();
        let mut cap = SetpointController::new(config("cap", Relationship::LessOrEquals, 2000.0, false));
        let mut want = SetpointController::new(config("want", Relationship::Equals, 4000.0, false));

        cap.run(&mut arbiter).unwrap();
        want.run(&mut arbiter).unwrap();
        assert_eq!(arbiter.constraints(&"ess0".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_conflict_is_clipped() {
        let mut arbiter = open_cycle();
        let mut cap = SetpointController::new(config("cap", Relationship::LessOrEquals, 2000.0, false));
        let mut want = SetpointController::new(config("want", Relationship::Equals, 4000.0, true));

        cap.run(&mut arbiter).unwrap();
        want.run(&mut arbiter).unwrap();

        let set = arbiter.constraints(&"ess0".into()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.pinned(&Variable::active("ess0", Phase::All)), Some(2000.0));
        assert_eq!(set.constraints()[1].description(), "want (clipped)");
    }

    #[test]
    fn test_full_discharge_is_clipped_to_polygon() {
        use crate::domain::outbound::RecordingChannel;

        let mut arbiter = open_cycle();
        let mut want = SetpointController::new(config("full", Relationship::Equals, 9500.0, true));
        want.run(&mut arbiter).unwrap();

        let pinned = arbiter
            .constraints(&"ess0".into())
            .unwrap()
            .pinned(&Variable::active("ess0", Phase::All))
            .unwrap();
        assert!(pinned < 9500.0 && pinned > 9200.0);

        let mut channel = RecordingChannel::new();
        let report = arbiter.end_cycle(&mut channel);
        assert_eq!(report.faults().count(), 0);
        let written = channel.value(&"ess0".into(), Phase::All, PowerType::Active).unwrap();
        assert!((written - pinned).abs() < 1.0);
    }

    #[test]
    fn test_closed_cycle_is_an_error() {
        let mut arbiter = open_cycle();
        arbiter.close_submissions();
        let mut want = SetpointController::new(config("want", Relationship::Equals, 100.0, true));
        assert!(want.run(&mut arbiter).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = config("", Relationship::Equals, 0.0, false);
        assert!(cfg.validate().is_err());
        cfg.id = "ok".into();
        assert!(cfg.validate().is_ok());
    }
}
