//! Poll loop and the publish cycle shared by startup and every tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::core::ManagerError;
use super::status::ManagerStatus;
use super::telemetry::ConfigManagerTelemetry;
use crate::builder::ResourceBuilder;
use crate::management::{ManagementClient, ServiceConfigDocument};
use crate::resolver::{resolve, RolloutState};
use crate::snapshot::{Snapshot, SnapshotStore};

/// What a successful poll tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The latest rollout is the one already committed.
    Unchanged,
    /// A new rollout kept the current config id; only the rollout id moved.
    RolloutAdvanced { rollout_id: String },
    /// A new config was built and published.
    Published { config_id: String },
}

/// State shared between the handle and the background poller.
pub(crate) struct ManagerShared {
    pub(crate) service_name: String,
    pub(crate) node_id: String,
    pub(crate) poll_interval: Duration,
    pub(crate) management: ManagementClient,
    pub(crate) builder: Arc<dyn ResourceBuilder>,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) status: Arc<ManagerStatus>,
    pub(crate) telemetry: Arc<dyn ConfigManagerTelemetry>,
}

impl ManagerShared {
    /// Builds and publishes `document`. The committed state is left to the caller.
    pub(crate) async fn publish_document(
        &self,
        document: &ServiceConfigDocument,
    ) -> Result<(), ManagerError> {
        let resources = self.builder.build(document)?;
        let snapshot = Snapshot::new(document.config_id.clone(), resources);
        self.store.publish(&self.node_id, snapshot).await?;
        self.status.record_publish();
        self.telemetry.on_publish(&self.node_id, &document.config_id);
        Ok(())
    }

    /// Fetches, builds and publishes `state.config_id`, then commits `state`.
    pub(crate) async fn apply(&self, state: RolloutState) -> Result<(), ManagerError> {
        let document = self
            .management
            .fetch_config(&self.service_name, &state.config_id)
            .await?;
        self.publish_document(&document).await?;
        info!(
            service = %self.service_name,
            rollout_id = %state.rollout_id,
            config_id = %state.config_id,
            "published new service configuration"
        );
        self.status.commit(state).await;
        Ok(())
    }

    /// One tick: list rollouts, resolve, and publish when the config changed.
    /// Nothing is committed unless every step succeeds.
    pub(crate) async fn perform_poll(&self) -> Result<PollOutcome, ManagerError> {
        let current = self.status.committed().await;
        debug!(service = %self.service_name, "checking for new rollouts");
        let candidates = self.management.fetch_rollouts(&self.service_name).await?;
        let resolution = resolve(&current, &candidates)?;

        if !resolution.changed {
            if resolution.state == current {
                return Ok(PollOutcome::Unchanged);
            }
            info!(
                service = %self.service_name,
                rollout_id = %resolution.state.rollout_id,
                config_id = %resolution.state.config_id,
                "no new configuration to load for new rollout"
            );
            let rollout_id = resolution.state.rollout_id.clone();
            self.status.commit(resolution.state).await;
            return Ok(PollOutcome::RolloutAdvanced { rollout_id });
        }

        let config_id = resolution.state.config_id.clone();
        self.apply(resolution.state).await?;
        Ok(PollOutcome::Published { config_id })
    }

    /// Runs [`Self::perform_poll`] every `poll_interval` until `shutdown`
    /// fires. A failed tick is logged and the loop carries on.
    pub(crate) async fn run_poller(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            service = %self.service_name,
            interval = ?self.poll_interval,
            "start checking new rollouts"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep(self.poll_interval) => {}
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.perform_poll() => result,
            };

            match result {
                Ok(outcome) => {
                    self.status.record_poll(true);
                    self.status.set_last_error(None).await;
                    self.telemetry.on_poll_success(&outcome);
                }
                Err(err) => {
                    error!(
                        service = %self.service_name,
                        %err,
                        "error occurred when checking new rollouts"
                    );
                    self.status.record_poll(false);
                    self.status.set_last_error(Some(err.to_string())).await;
                    self.telemetry.on_poll_error(&err);
                }
            }
        }
        debug!(service = %self.service_name, "rollout poller shutting down");
    }
}
