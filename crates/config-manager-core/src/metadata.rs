//! Client for the instance metadata server.
//!
//! Every request carries `Metadata-Flavor: Google`. Attribute lookups return
//! the plain-text body; token lookups feed [`crate::credentials::TokenCache`]
//! through the [`TokenFetcher`] implementation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use reqwest::Method;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{Token, TokenError, TokenFetcher, TokenResponse};
use crate::http::{join_segments, HttpClient, HttpError};

pub const ACCESS_TOKEN_PATH: &str = "/v1/instance/service-accounts/default/token";
pub const IDENTITY_TOKEN_PATH: &str = "/v1/instance/service-accounts/default/identity";
pub const SERVICE_NAME_PATH: &str = "/v1/instance/attributes/endpoints-service-name";
pub const CONFIG_ID_PATH: &str = "/v1/instance/attributes/endpoints-service-version";
pub const ROLLOUT_STRATEGY_PATH: &str = "/v1/instance/attributes/endpoints-rollout-strategy";
pub const PROJECT_ID_PATH: &str = "/v1/project/project-id";
pub const REGION_PATH: &str = "/v1/instance/region";
pub const ZONE_PATH: &str = "/v1/instance/zone";
pub const GAE_SERVER_SOFTWARE_PATH: &str = "/v1/instance/attributes/gae_server_software";
pub const KUBE_ENV_PATH: &str = "/v1/instance/attributes/kube-env";

/// Lifetime the metadata server guarantees for identity tokens.
pub const IDENTITY_TOKEN_EXPIRY: Duration = Duration::from_secs(3599);

const METADATA_FLAVOR: &str = "Metadata-Flavor";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed fetching metadata: {0}")]
    Http(#[from] HttpError),
    #[error("invalid zone format: {0:?}")]
    InvalidZone(String),
}

/// Hosting platform as inferred from metadata attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    GaeFlex,
    Gke,
    Gce,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::GaeFlex => "GAE(Flex)",
            Platform::Gke => "GKE",
            Platform::Gce => "GCE",
        })
    }
}

/// Facts about the hosting environment handed to the resource builder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcpAttributes {
    pub project_id: Option<String>,
    /// Region when the server exposes one, otherwise the zone name.
    pub zone: Option<String>,
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone)]
pub struct MetadataClient {
    http: HttpClient,
    base_url: String,
}

impl MetadataClient {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<String, HttpError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut url = join_segments(&self.base_url, &segments)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        let request = self
            .http
            .request(Method::GET, url)
            .header(METADATA_FLAVOR, HeaderValue::from_static("Google"));
        self.http.send_text(request).await
    }

    async fn attribute(&self, path: &str) -> Result<String, MetadataError> {
        Ok(self.get(path, &[]).await?.trim().to_string())
    }

    pub async fn fetch_service_name(&self) -> Result<String, MetadataError> {
        self.attribute(SERVICE_NAME_PATH).await
    }

    pub async fn fetch_config_id(&self) -> Result<String, MetadataError> {
        self.attribute(CONFIG_ID_PATH).await
    }

    pub async fn fetch_rollout_strategy(&self) -> Result<String, MetadataError> {
        self.attribute(ROLLOUT_STRATEGY_PATH).await
    }

    pub async fn fetch_project_id(&self) -> Result<String, MetadataError> {
        self.attribute(PROJECT_ID_PATH).await
    }

    /// Region if the server exposes one (Cloud Run), otherwise the last
    /// segment of `projects/PROJECT/zones/ZONE`.
    pub async fn fetch_location(&self) -> Result<String, MetadataError> {
        if let Ok(region) = self.attribute(REGION_PATH).await {
            return Ok(region);
        }
        let zone_path = self.attribute(ZONE_PATH).await?;
        match zone_path.rsplit_once('/') {
            Some((_, zone)) if !zone.is_empty() => Ok(zone.to_string()),
            _ => {
                warn!(zone = %zone_path, "invalid zone format fetched from metadata");
                Err(MetadataError::InvalidZone(zone_path))
            }
        }
    }

    pub async fn fetch_platform(&self) -> Platform {
        if self.get(GAE_SERVER_SOFTWARE_PATH, &[]).await.is_ok() {
            return Platform::GaeFlex;
        }
        if self.get(KUBE_ENV_PATH, &[]).await.is_ok() {
            return Platform::Gke;
        }
        Platform::Gce
    }

    /// Collects the platform attributes. Fails only when the metadata server
    /// itself is unreachable; individual lookups are best effort.
    pub async fn fetch_gcp_attributes(&self) -> Result<GcpAttributes, MetadataError> {
        self.get("", &[]).await?;

        let mut attributes = GcpAttributes::default();
        match self.fetch_project_id().await {
            Ok(project_id) => attributes.project_id = Some(project_id),
            Err(err) => debug!(%err, "project id not available from metadata"),
        }
        match self.fetch_location().await {
            Ok(zone) => attributes.zone = Some(zone),
            Err(err) => debug!(%err, "location not available from metadata"),
        }
        attributes.platform = Some(self.fetch_platform().await);
        Ok(attributes)
    }
}

#[async_trait]
impl TokenFetcher for MetadataClient {
    async fn fetch_access_token(&self) -> Result<Token, TokenError> {
        let body = self.get(ACCESS_TOKEN_PATH, &[]).await?;
        TokenResponse::parse(body.as_bytes())
    }

    async fn fetch_identity_token(&self, audience: &str) -> Result<Token, TokenError> {
        let value = self
            .get(
                IDENTITY_TOKEN_PATH,
                &[("audience", audience), ("format", "standard")],
            )
            .await?;
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(TokenError::EmptyToken);
        }
        Ok(Token {
            value,
            ttl: IDENTITY_TOKEN_EXPIRY,
        })
    }
}
