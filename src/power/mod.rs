//! Power arbitration core.
//!
//! Controllers express what they want as linear constraints over per-device
//! decision variables. Each cycle the arbiter collects them, intersects them
//! with the device's capacity envelope and writes exactly one set-point per
//! variable.

pub mod arbiter;
pub mod constraint;
pub mod constraint_set;
pub mod envelope;
pub mod error;
pub mod fault;
pub mod precision;
pub mod rate_limiter;
pub mod solver;
pub mod variable;

pub use arbiter::{Arbiter, ArbiterConfig, CycleReport, CycleState, DeviceOutcome};
pub use constraint::{Coefficient, Constraint, Relationship};
pub use constraint_set::{Bound, ConstraintSet, VariableBounds};
pub use envelope::{DegradeReason, Envelope, PhaseLimits};
pub use error::{Infeasible, PowerError};
pub use fault::{FaultLog, FaultReason, FaultRecord, FaultSink};
pub use rate_limiter::RateLimiter;
pub use solver::{SolvedPoint, Solver, SolverConfig};
pub use variable::{Phase, PowerType, Variable};
