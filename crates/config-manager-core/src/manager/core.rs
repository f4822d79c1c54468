//! Config manager orchestration.
//!
//! [`ConfigManager::start`] runs the startup cycle (identify the service,
//! pick the rollout strategy, publish the first snapshot) and, in managed
//! mode, spawns the background poller. Any startup failure is returned to
//! the caller; once running, failures only ever abandon a single tick.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::poll::ManagerShared;
use super::status::ManagerStatus;
use super::telemetry::{ConfigManagerTelemetry, NoopTelemetry};
use crate::builder::{BuildError, DocumentResourceBuilder, ResourceBuilder};
use crate::config::{ConfigError, ManagerConfig, RolloutStrategy};
use crate::credentials::{ServiceAccountKey, ServiceAccountTokenFetcher, TokenCache, TokenError};
use crate::http::{HttpClient, HttpClientOptions, HttpError};
use crate::management::{ManagementClient, ManagementError, ServiceConfigDocument};
use crate::metadata::{MetadataClient, MetadataError};
use crate::resolver::{resolve, ResolveError, RolloutState};
use crate::snapshot::{SnapshotStore, StoreError};

/// Error type surfaced by the config manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Management(#[from] ManagementError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("fail to make a snapshot: {0}")]
    Build(#[from] BuildError),
    #[error("fail to publish snapshot: {0}")]
    Store(#[from] StoreError),
    #[error("service name is not specified")]
    MissingServiceName,
    #[error("service config id is not specified")]
    MissingConfigId,
    #[error("failed to read metadata with key {key} from metadata server")]
    MetadataLookup {
        key: &'static str,
        #[source]
        source: Option<MetadataError>,
    },
}

/// Collaborators the manager drives.
#[derive(Clone)]
pub struct ManagerComponents {
    pub management: ManagementClient,
    /// Absent when running outside of GCP.
    pub metadata: Option<MetadataClient>,
    pub builder: Arc<dyn ResourceBuilder>,
    pub store: Arc<dyn SnapshotStore>,
    /// Access tokens used by `management`; also served by the token agent.
    pub tokens: Arc<TokenCache>,
}

impl std::fmt::Debug for ManagerComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerComponents")
            .field("management", &self.management)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl ManagerComponents {
    /// Wires the default collaborators from `config`.
    ///
    /// Tokens come from the service-account key when one is configured and
    /// from the metadata server otherwise. Platform attributes are looked up
    /// on a best-effort basis.
    pub async fn connect(
        config: &ManagerConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, ManagerError> {
        let http = HttpClient::new(&HttpClientOptions {
            request_timeout: config.http_request_timeout,
            root_certs_path: config.root_certs_path.clone(),
            ..HttpClientOptions::default()
        })?;

        let metadata = (!config.non_gcp)
            .then(|| MetadataClient::new(http.clone(), config.metadata_url.clone()));

        let tokens = match (&config.service_account_key, &metadata) {
            (Some(path), _) => {
                let key = ServiceAccountKey::from_file(path)?;
                info!(client_email = %key.client_email, "using service account key for access tokens");
                Arc::new(TokenCache::new(Arc::new(ServiceAccountTokenFetcher::new(
                    http.clone(),
                    key,
                )?)))
            }
            (None, Some(metadata)) => Arc::new(TokenCache::new(Arc::new(metadata.clone()))),
            (None, None) => return Err(ConfigError::MissingServiceAccountKey.into()),
        };

        let gcp_attributes = match &metadata {
            Some(metadata) => match metadata.fetch_gcp_attributes().await {
                Ok(attributes) => Some(attributes),
                Err(err) => {
                    warn!(%err, "metadata server is not reachable; continuing without platform attributes");
                    None
                }
            },
            None => None,
        };

        let management = ManagementClient::new(
            http,
            config.service_management_url.clone(),
            tokens.clone(),
        );

        Ok(Self {
            management,
            metadata,
            builder: Arc::new(DocumentResourceBuilder::new(gcp_attributes)),
            store,
            tokens,
        })
    }
}

/// Entry point of the control plane.
pub struct ConfigManager;

impl ConfigManager {
    /// Runs the startup cycle with no-op telemetry.
    pub async fn start(
        config: ManagerConfig,
        components: ManagerComponents,
    ) -> Result<ConfigManagerHandle, ManagerError> {
        Self::start_with_telemetry(config, components, Arc::new(NoopTelemetry)).await
    }

    /// Runs the startup cycle, publishing the first snapshot, and starts the
    /// poller in managed mode.
    pub async fn start_with_telemetry(
        config: ManagerConfig,
        components: ManagerComponents,
        telemetry: Arc<dyn ConfigManagerTelemetry>,
    ) -> Result<ConfigManagerHandle, ManagerError> {
        config.validate()?;
        let metadata = components
            .metadata
            .as_ref()
            .filter(|_| config.metadata_lookup_allowed());

        let static_document = match &config.service_json_path {
            Some(path) => Some(ServiceConfigDocument::from_file(path)?),
            None => None,
        };

        let service_name = match (&config.service_name, &static_document) {
            (Some(name), _) => name.clone(),
            (None, Some(document)) => document.service_name.clone(),
            (None, None) => discover_service_name(metadata).await?,
        };
        let strategy = discover_strategy(&config, metadata).await?;
        if static_document.is_some() && strategy == RolloutStrategy::Managed {
            return Err(ConfigError::ServiceJsonWithManagedStrategy.into());
        }

        let status = ManagerStatus::new(service_name.clone(), strategy, config.node_id.clone());
        let shared = Arc::new(ManagerShared {
            service_name: service_name.clone(),
            node_id: config.node_id.clone(),
            poll_interval: config.poll_interval,
            management: components.management,
            builder: components.builder,
            store: components.store,
            status: status.clone(),
            telemetry,
        });

        match (strategy, static_document) {
            (_, Some(document)) => {
                shared.publish_document(&document).await?;
                status
                    .commit(RolloutState::new("", document.config_id.clone()))
                    .await;
            }
            (RolloutStrategy::Fixed, None) => {
                let config_id = match &config.config_id {
                    Some(id) => id.clone(),
                    None => discover_config_id(metadata).await?,
                };
                shared.apply(RolloutState::new("", config_id)).await?;
            }
            (RolloutStrategy::Managed, None) => {
                let candidates = shared.management.fetch_rollouts(&service_name).await?;
                let resolution = resolve(&RolloutState::default(), &candidates)?;
                shared.apply(resolution.state).await?;
            }
        }

        let committed = status.committed().await;
        info!(
            service = %service_name,
            config_id = %committed.config_id,
            strategy = %strategy,
            "created config manager"
        );

        let shutdown = CancellationToken::new();
        let poller = match strategy {
            RolloutStrategy::Managed => {
                let token = shutdown.clone();
                Some(tokio::spawn(shared.clone().run_poller(token)))
            }
            RolloutStrategy::Fixed => None,
        };

        Ok(ConfigManagerHandle {
            shutdown,
            poller,
            shared,
        })
    }
}

async fn discover_service_name(metadata: Option<&MetadataClient>) -> Result<String, ManagerError> {
    let metadata = metadata.ok_or(ManagerError::MissingServiceName)?;
    match metadata.fetch_service_name().await {
        Ok(name) if !name.is_empty() => Ok(name),
        Ok(_) => Err(ManagerError::MetadataLookup {
            key: "endpoints-service-name",
            source: None,
        }),
        Err(err) => Err(ManagerError::MetadataLookup {
            key: "endpoints-service-name",
            source: Some(err),
        }),
    }
}

async fn discover_config_id(metadata: Option<&MetadataClient>) -> Result<String, ManagerError> {
    let metadata = metadata.ok_or(ManagerError::MissingConfigId)?;
    match metadata.fetch_config_id().await {
        Ok(id) if !id.is_empty() => Ok(id),
        Ok(_) => Err(ManagerError::MetadataLookup {
            key: "endpoints-service-version",
            source: None,
        }),
        Err(err) => Err(ManagerError::MetadataLookup {
            key: "endpoints-service-version",
            source: Some(err),
        }),
    }
}

/// Explicit setting, then metadata, then fixed. An unreadable metadata
/// attribute falls back to fixed; an unknown value is fatal.
async fn discover_strategy(
    config: &ManagerConfig,
    metadata: Option<&MetadataClient>,
) -> Result<RolloutStrategy, ManagerError> {
    if let Some(strategy) = config.rollout_strategy {
        return Ok(strategy);
    }
    let Some(metadata) = metadata else {
        return Ok(RolloutStrategy::Fixed);
    };
    match metadata.fetch_rollout_strategy().await {
        Ok(value) if value.is_empty() => Ok(RolloutStrategy::Fixed),
        Ok(value) => Ok(value.parse::<RolloutStrategy>()?),
        Err(err) => {
            info!(%err, "rollout strategy not found in metadata, using fixed");
            Ok(RolloutStrategy::Fixed)
        }
    }
}

/// Handle returned by [`ConfigManager::start`].
pub struct ConfigManagerHandle {
    shutdown: CancellationToken,
    poller: Option<JoinHandle<()>>,
    shared: Arc<ManagerShared>,
}

impl std::fmt::Debug for ConfigManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManagerHandle")
            .field("service_name", &self.shared.service_name)
            .field("polling", &self.poller.is_some())
            .finish()
    }
}

impl ConfigManagerHandle {
    pub fn status(&self) -> Arc<ManagerStatus> {
        self.shared.status.clone()
    }

    pub fn store(&self) -> Arc<dyn SnapshotStore> {
        self.shared.store.clone()
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    /// Whether a background poller is running (managed mode).
    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Token that stops the poller when cancelled; share it with other
    /// listeners so one signal stops everything.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the poller and waits for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Some(poller) = self.poller {
            if let Err(err) = poller.await {
                warn!("rollout poller terminated abnormally: {err}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }
}
