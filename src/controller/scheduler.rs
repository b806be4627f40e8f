use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use validator::Validate;

use super::Controller;
use crate::domain::outbound::OutboundChannel;
use crate::domain::snapshot::TelemetrySource;
use crate::power::{Arbiter, CycleReport, CycleState};

/// Cycle timing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CycleConfig {
    /// Cycle period (ms)
    #[validate(range(min = 10, max = 60000))]
    pub period_ms: u64,
    /// Time controllers get before submissions are cut off (ms)
    #[validate(range(min = 1))]
    pub deadline_ms: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            deadline_ms: 100,
        }
    }
}

impl CycleConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Per-controller run statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Runs that started after the submission cut-off
    pub late_count: u64,
}

/// Runs one arbitration cycle: begin, every controller in priority order,
/// end. Controllers are kept in the order they were added; the first one
/// has the highest priority.
pub struct CycleScheduler {
    config: CycleConfig,
    controllers: Vec<Box<dyn Controller>>,
    statuses: Vec<ControllerStatus>,
}

impl CycleScheduler {
    pub fn new(config: CycleConfig) -> Self {
        Self {
            config,
            controllers: Vec::new(),
            statuses: Vec::new(),
        }
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Appends a controller with the lowest priority so far
    pub fn add_controller(&mut self, controller: Box<dyn Controller>) {
        self.controllers.push(controller);
        self.statuses.push(ControllerStatus::default());
    }

    pub fn controller_ids(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.id()).collect()
    }

    pub fn status(&self, id: &str) -> Option<&ControllerStatus> {
        self.controllers
            .iter()
            .position(|c| c.id() == id)
            .and_then(|i| self.statuses.get(i))
    }

    pub fn run_cycle(
        &mut self,
        arbiter: &mut Arbiter,
        telemetry: &dyn TelemetrySource,
        outbound: &mut dyn OutboundChannel,
        now: DateTime<Utc>,
    ) -> CycleReport {
        arbiter.begin_cycle(telemetry, now);
        let started = Instant::now();
        let deadline = self.config.deadline();

        for (controller, status) in self.controllers.iter_mut().zip(self.statuses.iter_mut()) {
            if arbiter.state() == CycleState::AcceptingConstraints && started.elapsed() > deadline {
                warn!(
                    cycle = arbiter.cycle(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    deadline_ms = self.config.deadline_ms,
                    "cycle deadline reached, closing submissions"
                );
                arbiter.close_submissions();
            }

            status.last_run = Some(now);
            status.run_count += 1;
            if arbiter.state() != CycleState::AcceptingConstraints {
                status.late_count += 1;
            }

            match controller.run(arbiter) {
                Ok(()) => {
                    status.last_success = Some(now);
                    status.success_count += 1;
                    status.last_error = None;
                    debug!(controller = controller.id(), "controller ran");
                }
                Err(e) => {
                    status.error_count += 1;
                    status.last_error = Some(e.to_string());
                    warn!(controller = controller.id(), error = %e, "controller failed");
                }
            }
        }

        arbiter.close_submissions();
        arbiter.end_cycle(outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::{DeviceId, DeviceSpec};
    use crate::domain::outbound::RecordingChannel;
    use crate::domain::snapshot::{RatedLimits, TelemetryCache, TelemetrySnapshot};
    use crate::power::{ArbiterConfig, Constraint, Phase, PowerType, Variable};

    struct Fixed {
        id: String,
        target: f64,
        delay: Option<Duration>,
    }

    impl Controller for Fixed {
        fn id(&self) -> &str {
            &self.id
        }

        fn run(&mut self, arbiter: &mut Arbiter) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            arbiter.submit(
                &DeviceId::from("ess0"),
                Constraint::equals(self.id.clone(), Variable::active("ess0", Phase::All), self.target),
            )?;
            Ok(())
        }
    }

    fn setup() -> (Arbiter, TelemetryCache) {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        arbiter.register_device(DeviceSpec::symmetric("ess0")).unwrap();
        let mut cache = TelemetryCache::new();
        cache.update(
            "ess0".into(),
            TelemetrySnapshot::new_now(50.0, RatedLimits::symmetric(10_000.0)),
        );
        (arbiter, cache)
    }

    #[test]
    fn test_priority_order() {
        let (mut arbiter, cache) = setup();
        let mut scheduler = CycleScheduler::new(CycleConfig::default());
        scheduler.add_controller(Box::new(Fixed { id: "first".into(), target: 1000.0, delay: None }));
        scheduler.add_controller(Box::new(Fixed { id: "second".into(), target: 2000.0, delay: None }));
        assert_eq!(scheduler.controller_ids(), vec!["first", "second"]);

        let mut channel = RecordingChannel::new();
        let report = scheduler.run_cycle(&mut arbiter, &cache, &mut channel, Utc::now());

        assert_eq!(channel.value(&"ess0".into(), Phase::All, PowerType::Active), Some(1000.0));
        assert_eq!(report.rejected, 1);
        assert_eq!(scheduler.status("first").unwrap().success_count, 1);
        let second = scheduler.status("second").unwrap();
        assert_eq!(second.error_count, 1);
        assert!(second.last_error.as_ref().unwrap().contains("first"));
    }

    #[test]
    fn test_deadline_closes_submissions() {
        let (mut arbiter, cache) = setup();
        let mut scheduler = CycleScheduler::new(CycleConfig { period_ms: 1000, deadline_ms: 5 });
        scheduler.add_controller(Box::new(Fixed {
            id: "slow".into(),
            target: 1000.0,
            delay: Some(Duration::from_millis(20)),
        }));
        scheduler.add_controller(Box::new(Fixed { id: "late".into(), target: 1000.0, delay: None }));

        let mut channel = RecordingChannel::new();
        let report = scheduler.run_cycle(&mut arbiter, &cache, &mut channel, Utc::now());

        // the slow controller started in time, its own submission counts
        assert_eq!(channel.value(&"ess0".into(), Phase::All, PowerType::Active), Some(1000.0));
        assert_eq!(report.late, 1);
        let late = scheduler.status("late").unwrap();
        assert_eq!(late.late_count, 1);
        assert_eq!(late.error_count, 1);
        assert_eq!(arbiter.state(), CycleState::Idle);
    }
}
