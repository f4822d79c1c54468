//! Shared fixtures for config manager tests.

#![cfg(test)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httptest::Server;
use serde_json::{json, Value};

use super::ManagerComponents;
use crate::builder::{BuildError, DocumentResourceBuilder, ResourceBuilder};
use crate::config::{ManagerConfig, RolloutStrategy};
use crate::credentials::{Token, TokenCache, TokenError, TokenFetcher};
use crate::http::{HttpClient, HttpClientOptions};
use crate::management::{ManagementClient, ServiceConfigDocument};
use crate::metadata::MetadataClient;
use crate::snapshot::{
    FetchRequest, ResourceSet, Snapshot, SnapshotCache, SnapshotStore, StoreError,
};
use tokio::sync::watch;

pub(crate) const SERVICE: &str = "bookstore.endpoints.example.com";
pub(crate) const NODE: &str = "api_proxy";
pub(crate) const ACCESS_TOKEN: &str = "ya29.manager-test";

/// Hands out the same access token forever.
#[derive(Debug)]
pub(crate) struct StaticFetcher;

#[async_trait]
impl TokenFetcher for StaticFetcher {
    async fn fetch_access_token(&self) -> Result<Token, TokenError> {
        Ok(Token {
            value: ACCESS_TOKEN.to_string(),
            ttl: Duration::from_secs(3599),
        })
    }
}

fn http() -> HttpClient {
    HttpClient::new(&HttpClientOptions {
        request_timeout: Duration::from_secs(5),
        ..HttpClientOptions::default()
    })
    .expect("http client")
}

/// Components talking to `server` for management calls. When `with_metadata`
/// is set, the metadata client targets `/computeMetadata` on the same server.
pub(crate) fn components(
    server: &Server,
    store: Arc<SnapshotCache>,
    with_metadata: bool,
) -> ManagerComponents {
    let tokens = Arc::new(TokenCache::new(Arc::new(StaticFetcher)));
    ManagerComponents {
        management: ManagementClient::new(http(), server.url_str(""), tokens.clone()),
        metadata: with_metadata
            .then(|| MetadataClient::new(http(), server.url_str("/computeMetadata"))),
        builder: Arc::new(DocumentResourceBuilder::default()),
        store,
        tokens,
    }
}

pub(crate) fn managed_config() -> ManagerConfig {
    ManagerConfig {
        service_name: Some(SERVICE.to_string()),
        rollout_strategy: Some(RolloutStrategy::Managed),
        node_id: NODE.to_string(),
        ..ManagerConfig::default()
    }
}

pub(crate) fn fixed_config(config_id: &str) -> ManagerConfig {
    ManagerConfig {
        service_name: Some(SERVICE.to_string()),
        config_id: Some(config_id.to_string()),
        rollout_strategy: Some(RolloutStrategy::Fixed),
        node_id: NODE.to_string(),
        ..ManagerConfig::default()
    }
}

/// One successful rollout with its traffic split.
pub(crate) fn rollout(rollout_id: &str, percentages: &[(&str, f64)]) -> Value {
    let percentages: serde_json::Map<String, Value> = percentages
        .iter()
        .map(|(config_id, percent)| (config_id.to_string(), json!(percent)))
        .collect();
    json!({
        "rolloutId": rollout_id,
        "status": "SUCCESS",
        "trafficPercentStrategy": { "percentages": percentages },
    })
}

/// Body of a rollout listing, most recent first.
pub(crate) fn rollouts_body(rollouts: &[Value]) -> String {
    json!({ "rollouts": rollouts }).to_string()
}

pub(crate) fn config_body(config_id: &str) -> String {
    json!({
        "name": SERVICE,
        "id": config_id,
        "title": "Bookstore",
        "apis": [{ "name": "endpoints.examples.bookstore.Bookstore" }],
    })
    .to_string()
}

pub(crate) fn rollouts_path() -> String {
    format!("/v1/services/{SERVICE}/rollouts")
}

pub(crate) fn config_path(config_id: &str) -> String {
    format!("/v1/services/{SERVICE}/configs/{config_id}")
}

/// Version currently published for [`NODE`], if any.
pub(crate) async fn published_version(store: &SnapshotCache) -> Option<String> {
    store
        .fetch(&FetchRequest::new(NODE))
        .await
        .ok()
        .map(|snapshot: Arc<Snapshot>| snapshot.version().to_string())
}

/// Builds every document except `rejected`.
#[derive(Debug)]
pub(crate) struct RejectingBuilder {
    pub(crate) rejected: &'static str,
}

impl ResourceBuilder for RejectingBuilder {
    fn build(&self, document: &ServiceConfigDocument) -> Result<ResourceSet, BuildError> {
        if document.config_id == self.rejected {
            return Err(BuildError::Rejected(format!(
                "listener for {} is invalid",
                document.config_id
            )));
        }
        DocumentResourceBuilder::default().build(document)
    }
}

/// Delegates to a [`SnapshotCache`] until `fail_publish` is set.
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    pub(crate) inner: SnapshotCache,
    pub(crate) fail_publish: AtomicBool,
}

#[async_trait]
impl SnapshotStore for FlakyStore {
    async fn publish(&self, node: &str, snapshot: Snapshot) -> Result<(), StoreError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(StoreError::EmptyVersion);
        }
        self.inner.publish(node, snapshot).await
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Arc<Snapshot>, StoreError> {
        self.inner.fetch(request).await
    }

    async fn watch(&self, node: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.inner.watch(node).await
    }
}
