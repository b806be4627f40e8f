pub mod scheduler;
pub mod setpoint;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::{info, warn};

use crate::domain::outbound::OutboundChannel;
use crate::domain::snapshot::TelemetryCache;
use crate::power::Arbiter;

pub use scheduler::{ControllerStatus, CycleConfig, CycleScheduler};
pub use setpoint::{SetpointConfig, SetpointController};

/// A control strategy. Runs once per cycle, in priority order, and
/// expresses what it wants by submitting constraints to the arbiter.
pub trait Controller: Send {
    fn id(&self) -> &str;

    fn run(&mut self, arbiter: &mut Arbiter) -> Result<()>;
}

/// Device link driven by the control loop: polled before a cycle, written
/// to at the end of it.
pub trait DeviceBridge: OutboundChannel {
    fn poll(&mut self, now: DateTime<Utc>) -> TelemetryCache;
}

/// Runs cycles at the scheduler's period until `shutdown` resolves.
/// Returns the number of completed cycles.
pub async fn run_cycles<B, S>(
    arbiter: &mut Arbiter,
    scheduler: &mut CycleScheduler,
    bridge: &mut B,
    shutdown: S,
) -> Result<u64>
where
    B: DeviceBridge,
    S: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(scheduler.config().period());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut completed = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                let now = Utc::now();
                let telemetry = bridge.poll(now);
                let report = scheduler.run_cycle(arbiter, &telemetry, bridge, now);
                completed += 1;

                let faults = report.faults().count();
                if faults > 0 {
                    warn!(cycle = report.cycle, faults, "cycle finished with faulted devices");
                }
                info!(
                    cycle = report.cycle,
                    devices = report.outcomes.len(),
                    rejected = report.rejected,
                    late = report.late,
                    faults,
                    "control cycle"
                );
            }
        }
    }
    Ok(completed)
}
