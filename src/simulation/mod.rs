//! # Device Simulation
//!
//! Simulated energy storage systems standing in for the hardware bridge:
//! they accept set-points like an inverter would and report telemetry
//! derived from what they were told to do.

pub mod ess;
pub mod fleet;

pub use ess::SimulatedEss;
pub use fleet::SimulatedFleet;
