//! Versioned resource snapshots and the store proxies read them from.
//!
//! A [`Snapshot`] is immutable once built. Publishing replaces the node's
//! current `Arc<Snapshot>` in one step, so a reader holds either the old set
//! or the new one, never a mix. Subscribers are notified through a
//! `tokio::sync::watch` channel after the swap.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("snapshot version must not be empty")]
    EmptyVersion,
    #[error("no snapshot published for node {0:?}")]
    UnknownNode(String),
    #[error("node {node:?} is already at version {version:?}")]
    UpToDate { node: String, version: String },
}

/// One proxy-consumable resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub type_url: String,
    pub name: String,
    pub body: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResourceSet {
    resources: Vec<Resource>,
}

impl ResourceSet {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self { resources }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Resources with the given type url, in insertion order.
    pub fn of_type<'a>(&'a self, type_url: &'a str) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources
            .iter()
            .filter(move |resource| resource.type_url == type_url)
    }
}

/// A versioned, immutable resource set. The version is the config id it
/// was built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    version: String,
    resources: Arc<ResourceSet>,
}

impl Snapshot {
    pub fn new(version: impl Into<String>, resources: ResourceSet) -> Self {
        Self {
            version: version.into(),
            resources: Arc::new(resources),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }
}

/// A subscriber's request: which node, and the version it already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub node_id: String,
    pub version_info: Option<String>,
}

impl FetchRequest {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            version_info: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version_info = Some(version.into());
        self
    }
}

/// Where the manager publishes and subscribers read.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Atomically replaces the snapshot of `node`.
    async fn publish(&self, node: &str, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Current snapshot of the requested node. Fails with
    /// [`StoreError::UpToDate`] when the caller already holds that version.
    async fn fetch(&self, request: &FetchRequest) -> Result<Arc<Snapshot>, StoreError>;

    /// Receiver that observes every publish for `node`, starting with the
    /// current snapshot (if any).
    async fn watch(&self, node: &str) -> watch::Receiver<Option<Arc<Snapshot>>>;
}

/// In-memory [`SnapshotStore`], one watch channel per node.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    nodes: RwLock<HashMap<String, watch::Sender<Option<Arc<Snapshot>>>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes that currently have a snapshot, sorted.
    pub async fn nodes(&self) -> Vec<String> {
        let nodes = self.nodes.read().await;
        let mut names: Vec<String> = nodes
            .iter()
            .filter(|(_, sender)| sender.borrow().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SnapshotStore for SnapshotCache {
    async fn publish(&self, node: &str, snapshot: Snapshot) -> Result<(), StoreError> {
        if snapshot.version.is_empty() {
            return Err(StoreError::EmptyVersion);
        }
        let version = snapshot.version.clone();
        let resources = snapshot.resources.len();
        let snapshot = Arc::new(snapshot);

        let mut nodes = self.nodes.write().await;
        match nodes.get(node) {
            Some(sender) => {
                sender.send_replace(Some(snapshot));
            }
            None => {
                let (sender, _) = watch::channel(Some(snapshot));
                nodes.insert(node.to_string(), sender);
            }
        }
        debug!(node, version, resources, "published snapshot");
        Ok(())
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Arc<Snapshot>, StoreError> {
        let nodes = self.nodes.read().await;
        let current = nodes
            .get(&request.node_id)
            .and_then(|sender| sender.borrow().clone())
            .ok_or_else(|| StoreError::UnknownNode(request.node_id.clone()))?;
        if request.version_info.as_deref() == Some(current.version()) {
            return Err(StoreError::UpToDate {
                node: request.node_id.clone(),
                version: current.version.clone(),
            });
        }
        Ok(current)
    }

    async fn watch(&self, node: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        if let Some(sender) = self.nodes.read().await.get(node) {
            return sender.subscribe();
        }
        let mut nodes = self.nodes.write().await;
        nodes
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}
