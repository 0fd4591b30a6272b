//! Runner of the privacy-preserving face verification benchmark.
//!
//! Drives the secure computation engine on two hosts, one per protocol role,
//! and records every successful trial in a CSV dataset.

pub mod cli;
pub mod config;
pub mod driver;
pub mod energy;
pub mod engine;
pub mod extract;
pub mod logging;
pub mod party;
pub mod provision;
pub mod recorder;
pub mod run;
pub mod subjects;
pub mod transport;

pub use config::RunnerConfig;
pub use driver::{DriverOutput, ProtocolDriver, RoleCommand, RoleOutput, TrialFailure};
pub use run::{RunSummary, Runner, run_benchmark};

/// Identifier of a run, the local start time.
pub fn run_id() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}
