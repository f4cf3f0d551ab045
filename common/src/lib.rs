// Common library shared by the scheduler daemon and the run-now worker

pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod executor;
pub mod lock;
pub mod models;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod worker;
