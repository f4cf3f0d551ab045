// Worker module: executes catalog entries on behalf of the daemon and the
// run-now binary

pub mod manual;
pub mod runner;

pub use manual::{run_now, RunSummary};
pub use runner::{ExecutionRunner, RunResult, RunnerOptions};
