//! Manager-level telemetry hooks.
//!
//! Embedders implement [`ConfigManagerTelemetry`] to observe poll outcomes
//! and publishes. Every method defaults to a no-op.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ManagerError, PollOutcome};

pub trait ConfigManagerTelemetry: Send + Sync {
    /// Called after a poll tick completed without error.
    fn on_poll_success(&self, _outcome: &PollOutcome) {}
    /// Called when a poll tick was abandoned.
    fn on_poll_error(&self, _error: &ManagerError) {}
    /// Called after a snapshot was published.
    fn on_publish(&self, _node: &str, _version: &str) {}
}

/// Default telemetry implementation that performs no-ops.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl ConfigManagerTelemetry for NoopTelemetry {}

/// Counts hook invocations. Handy for tests and simple health probes.
#[derive(Debug, Default)]
pub struct CountingTelemetry {
    pub poll_success: AtomicUsize,
    pub poll_error: AtomicUsize,
    pub publishes: AtomicUsize,
}

impl CountingTelemetry {
    pub fn poll_successes(&self) -> usize {
        self.poll_success.load(Ordering::SeqCst)
    }

    pub fn poll_errors(&self) -> usize {
        self.poll_error.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

impl ConfigManagerTelemetry for CountingTelemetry {
    fn on_poll_success(&self, _outcome: &PollOutcome) {
        self.poll_success.fetch_add(1, Ordering::SeqCst);
    }

    fn on_poll_error(&self, _error: &ManagerError) {
        self.poll_error.fetch_add(1, Ordering::SeqCst);
    }

    fn on_publish(&self, _node: &str, _version: &str) {
        self.publishes.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolveError;

    #[test]
    fn noop_telemetry_accepts_every_hook() {
        let telemetry = NoopTelemetry;
        telemetry.on_poll_success(&PollOutcome::Unchanged);
        telemetry.on_poll_error(&ManagerError::Resolve(ResolveError::NoActiveRollouts));
        telemetry.on_publish("node", "c1");
    }

    #[test]
    fn counting_telemetry_counts() {
        let telemetry = CountingTelemetry::default();
        telemetry.on_poll_success(&PollOutcome::Published {
            config_id: "c1".into(),
        });
        telemetry.on_poll_error(&ManagerError::Resolve(ResolveError::NoActiveRollouts));
        telemetry.on_poll_error(&ManagerError::Resolve(ResolveError::NoActiveRollouts));
        telemetry.on_publish("node", "c1");
        assert_eq!(telemetry.poll_successes(), 1);
        assert_eq!(telemetry.poll_errors(), 2);
        assert_eq!(telemetry.publish_count(), 1);
    }
}
