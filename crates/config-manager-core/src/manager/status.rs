//! Shared, read-mostly view of the manager's committed state.
//!
//! The poll loop is the only writer. Admin handlers and other tasks read the
//! committed [`RolloutState`] and the counters concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::RolloutStrategy;
use crate::resolver::RolloutState;

#[derive(Debug)]
pub struct ManagerStatus {
    service_name: String,
    rollout_strategy: RolloutStrategy,
    node_id: String,
    committed: RwLock<RolloutState>,
    last_error: RwLock<Option<String>>,
    polls: AtomicU64,
    poll_failures: AtomicU64,
    publishes: AtomicU64,
}

impl ManagerStatus {
    pub fn new(
        service_name: impl Into<String>,
        rollout_strategy: RolloutStrategy,
        node_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_name: service_name.into(),
            rollout_strategy,
            node_id: node_id.into(),
            committed: RwLock::new(RolloutState::default()),
            last_error: RwLock::new(None),
            polls: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn rollout_strategy(&self) -> RolloutStrategy {
        self.rollout_strategy
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The last fully committed rollout/config pair.
    pub async fn committed(&self) -> RolloutState {
        self.committed.read().await.clone()
    }

    pub(crate) async fn commit(&self, state: RolloutState) {
        *self.committed.write().await = state;
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub(crate) async fn set_last_error(&self, error: Option<String>) {
        *self.last_error.write().await = error;
    }

    pub(crate) fn record_poll(&self, success: bool) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.poll_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn poll_failures(&self) -> u64 {
        self.poll_failures.load(Ordering::Relaxed)
    }

    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    /// Renders the status document served by the admin endpoint.
    pub async fn to_json(&self) -> Value {
        let committed = self.committed().await;
        json!({
            "serviceName": self.service_name,
            "rolloutStrategy": self.rollout_strategy.as_str(),
            "nodeId": self.node_id,
            "rolloutId": committed.rollout_id,
            "configId": committed.config_id,
            "pollCount": self.poll_count(),
            "pollFailures": self.poll_failures(),
            "publishCount": self.publish_count(),
            "lastError": self.last_error().await,
        })
    }
}
