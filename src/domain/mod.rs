pub mod device;
pub mod outbound;
pub mod snapshot;

pub use device::*;
pub use outbound::*;
pub use snapshot::*;
