use anyhow::{Context, Result};
use ess_power_arbiter::controller::{self, CycleScheduler, SetpointController};
use ess_power_arbiter::power::Arbiter;
use ess_power_arbiter::simulation::SimulatedFleet;
use ess_power_arbiter::{config::Config, telemetry};
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine, the environment may already be set
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;

    let mut arbiter = Arbiter::new(cfg.arbiter.clone());
    for spec in &cfg.devices {
        arbiter
            .register_device(spec.clone())
            .with_context(|| format!("registering device '{}'", spec.id))?;
    }

    let mut scheduler = CycleScheduler::new(cfg.cycle.clone());
    for setpoint in &cfg.controllers {
        scheduler.add_controller(Box::new(SetpointController::new(setpoint.clone())));
    }

    let mut fleet = SimulatedFleet::from_config(&cfg.simulation)?;
    for spec in &cfg.devices {
        if fleet.device(&spec.id).is_none() {
            warn!(device = %spec.id, "no simulated device configured, it will stay at zero power");
        }
    }

    info!(
        devices = cfg.devices.len(),
        controllers = cfg.controllers.len(),
        period_ms = cfg.cycle.period_ms,
        deadline_ms = cfg.cycle.deadline_ms,
        "starting ESS power arbiter"
    );

    let cycles = controller::run_cycles(
        &mut arbiter,
        &mut scheduler,
        &mut fleet,
        telemetry::shutdown_signal(),
    )
    .await?;

    warn!(cycles, "shutdown complete");
    Ok(())
}
