//! Config manager module facade.
//!
//! Re-exports the orchestrator API and wires the submodules implementing the
//! poll loop, the status handle and telemetry hooks.

mod core;
mod poll;
mod status;
mod telemetry;
#[cfg(test)]
mod test_support;

pub use self::core::*;
pub use poll::PollOutcome;
pub use status::ManagerStatus;
pub use telemetry::{ConfigManagerTelemetry, CountingTelemetry, NoopTelemetry};
