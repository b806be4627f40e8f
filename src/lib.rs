pub mod config;
pub mod controller;
pub mod domain;
pub mod power;
#[cfg(feature = "sim")]
pub mod simulation;
pub mod telemetry;
