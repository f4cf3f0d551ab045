// Scheduler module: the daemon loop, its fire registry and the lease that
// keeps a second daemon off the same catalog

pub mod engine;
pub mod lease;
pub mod registry;

pub use engine::{DaemonState, EngineConfig, SchedulerEngine, SchedulerHandle};
pub use lease::{DaemonLease, LeaseRecord};
pub use registry::FireRegistry;
