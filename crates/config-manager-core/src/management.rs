//! Service management API client.
//!
//! Two read-only calls: the list of successful rollouts for a service, and a
//! full service config document by id. Every call carries a bearer token from
//! the configured [`AccessTokenProvider`]. Failures are returned as-is; the
//! poll loop decides what to do with them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::AUTHORIZATION;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{AccessTokenProvider, TokenError};
use crate::http::{bearer, join_segments, HttpClient, HttpError};
use crate::resolver::RolloutCandidate;

#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("fail to get access token: {0}")]
    Token(#[from] TokenError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("fail to unmarshal {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid service config: {0}")]
    InvalidDocument(String),
    #[error("fail to read service config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Body of `GET /v1/services/{service}/rollouts`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListServiceRolloutsResponse {
    #[serde(default)]
    pub rollouts: Vec<Rollout>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub rollout_id: String,
    #[serde(default)]
    pub traffic_percent_strategy: Option<TrafficPercentStrategy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrafficPercentStrategy {
    #[serde(default)]
    pub percentages: BTreeMap<String, f64>,
}

impl From<Rollout> for RolloutCandidate {
    fn from(rollout: Rollout) -> Self {
        RolloutCandidate {
            rollout_id: rollout.rollout_id,
            traffic_percentages: rollout
                .traffic_percent_strategy
                .map(|strategy| strategy.percentages)
                .unwrap_or_default(),
        }
    }
}

/// A service config document, identified by `(service_name, config_id)`.
///
/// The body is kept as opaque JSON; only the resource builder interprets it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfigDocument {
    pub service_name: String,
    pub config_id: String,
    raw: Arc<Value>,
}

impl ServiceConfigDocument {
    pub fn new(service_name: String, config_id: String, raw: Value) -> Self {
        Self {
            service_name,
            config_id,
            raw: Arc::new(raw),
        }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The `name` field of the document, if present.
    pub fn declared_name(&self) -> Option<&str> {
        self.raw.get("name").and_then(Value::as_str)
    }

    /// Loads a document from a local file; `id` and `name` inside the file
    /// become the config id and service name.
    pub fn from_file(path: &Path) -> Result<Self, ManagementError> {
        let raw = std::fs::read(path).map_err(|source| ManagementError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let value = decode_object(&raw, "service config file")?;
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    ManagementError::InvalidDocument(format!(
                        "{} has no {name:?} field",
                        path.display()
                    ))
                })
        };
        let config_id = field("id")?;
        let service_name = field("name")?;
        Ok(Self::new(service_name, config_id, value))
    }
}

fn decode_object(body: &[u8], what: &'static str) -> Result<Value, ManagementError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|source| ManagementError::Decode { what, source })?;
    if !value.is_object() {
        return Err(ManagementError::InvalidDocument(format!(
            "{what} is not a JSON object"
        )));
    }
    Ok(value)
}

#[derive(Clone)]
pub struct ManagementClient {
    http: HttpClient,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl std::fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ManagementClient {
    pub fn new(
        http: HttpClient,
        base_url: impl Into<String>,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Successful rollouts for `service`, most recent first.
    pub async fn fetch_rollouts(
        &self,
        service: &str,
    ) -> Result<Vec<RolloutCandidate>, ManagementError> {
        let mut url = join_segments(&self.base_url, &["v1", "services", service, "rollouts"])?;
        url.query_pairs_mut().append_pair("filter", "status=SUCCESS");
        let body = self.get(url).await?;
        let response: ListServiceRolloutsResponse = serde_json::from_slice(&body)
            .map_err(|source| ManagementError::Decode {
                what: "rollouts response",
                source,
            })?;
        debug!(
            service,
            count = response.rollouts.len(),
            "fetched rollouts"
        );
        Ok(response.rollouts.into_iter().map(Into::into).collect())
    }

    /// The full service config `config_id` of `service`.
    pub async fn fetch_config(
        &self,
        service: &str,
        config_id: &str,
    ) -> Result<ServiceConfigDocument, ManagementError> {
        let mut url = join_segments(
            &self.base_url,
            &["v1", "services", service, "configs", config_id],
        )?;
        url.query_pairs_mut().append_pair("view", "FULL");
        let body = self.get(url).await?;
        let value = decode_object(&body, "service config")?;
        let document =
            ServiceConfigDocument::new(service.to_string(), config_id.to_string(), value);
        if let Some(declared) = document.declared_name() {
            if declared != service {
                warn!(
                    service,
                    config_id,
                    declared_name = declared,
                    "service config name does not match the configured service name"
                );
            }
        }
        Ok(document)
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>, ManagementError> {
        let token = self.tokens.access_token().await?;
        let request = self
            .http
            .request(Method::GET, url)
            .header(AUTHORIZATION, bearer(&token.value)?);
        Ok(self.http.send(request).await?)
    }
}
