//! Process configuration for the config manager.
//!
//! [`ManagerConfig`] is built once at startup (usually through
//! [`ManagerConfig::from_os_env`]) and handed to the manager by value; nothing
//! in the crate reads the environment after that point.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::http::DEFAULT_REQUEST_TIMEOUT;

const ENV_SERVICE_NAME: &str = "APIPROXY_SERVICE_NAME";
const ENV_CONFIG_ID: &str = "APIPROXY_CONFIG_ID";
const ENV_ROLLOUT_STRATEGY: &str = "APIPROXY_ROLLOUT_STRATEGY";
const ENV_CHECK_METADATA: &str = "APIPROXY_CHECK_METADATA";
const ENV_NON_GCP: &str = "APIPROXY_NON_GCP";
const ENV_SERVICE_JSON_PATH: &str = "APIPROXY_SERVICE_JSON_PATH";
const ENV_SERVICE_ACCOUNT_KEY: &str = "APIPROXY_SERVICE_ACCOUNT_KEY";
const ENV_METADATA_URL: &str = "APIPROXY_METADATA_URL";
const ENV_SERVICE_MANAGEMENT_URL: &str = "APIPROXY_SERVICE_MANAGEMENT_URL";
const ENV_ROOT_CERTS_PATH: &str = "APIPROXY_ROOT_CERTS_PATH";
const ENV_POLL_INTERVAL_SECS: &str = "APIPROXY_POLL_INTERVAL_SECS";
const ENV_HTTP_REQUEST_TIMEOUT_SECS: &str = "APIPROXY_HTTP_REQUEST_TIMEOUT_SECS";
const ENV_NODE_ID: &str = "APIPROXY_NODE_ID";
const ENV_ADMIN_PORT: &str = "APIPROXY_ADMIN_PORT";
const ENV_TOKEN_AGENT_PORT: &str = "APIPROXY_TOKEN_AGENT_PORT";
/// Read by the binary before logging is initialised.
pub const ENV_LOG_LEVEL: &str = "APIPROXY_LOG_LEVEL";

/// Default instance metadata server.
pub const DEFAULT_METADATA_URL: &str = "http://169.254.169.254/computeMetadata";
/// Default service management API.
pub const DEFAULT_SERVICE_MANAGEMENT_URL: &str = "https://servicemanagement.googleapis.com";
/// Default cadence of the managed-mode poll loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Smallest poll interval accepted by [`ManagerConfig::sanitise`].
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Node key snapshots are published under when none is configured.
pub const DEFAULT_NODE_ID: &str = "api_proxy";
/// Log level used when `APIPROXY_LOG_LEVEL` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration problems detected before any network call is made.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(r#"rollout strategy must be either "managed" or "fixed", got {0:?}"#)]
    InvalidRolloutStrategy(String),
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("a service account key is required when running outside of GCP")]
    MissingServiceAccountKey,
    #[error("a static service config file can only be used with the fixed rollout strategy")]
    ServiceJsonWithManagedStrategy,
    #[error("the token agent needs a service account key to serve tokens from")]
    TokenAgentWithoutKey,
    #[error("admin and token agent listeners cannot share port {0}")]
    PortConflict(u16),
}

/// How the manager decides which config id is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RolloutStrategy {
    /// One config id, resolved once at startup.
    Fixed,
    /// Follow the most recent successful rollout, polling for changes.
    Managed,
}

impl RolloutStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutStrategy::Fixed => "fixed",
            RolloutStrategy::Managed => "managed",
        }
    }
}

impl fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RolloutStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fixed" => Ok(RolloutStrategy::Fixed),
            "managed" => Ok(RolloutStrategy::Managed),
            other => Err(ConfigError::InvalidRolloutStrategy(other.to_string())),
        }
    }
}

/// Settings for one config manager process.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Service whose configuration is served. Discovered from metadata when unset.
    pub service_name: Option<String>,
    /// Config id used in fixed mode. Discovered from metadata when unset.
    pub config_id: Option<String>,
    /// Explicit rollout strategy; `None` means metadata, then fixed.
    pub rollout_strategy: Option<RolloutStrategy>,
    /// Whether missing identifiers may be looked up on the metadata server.
    pub check_metadata: bool,
    /// Running outside of GCP: no metadata server, credentials come from a key file.
    pub non_gcp: bool,
    /// Local service config document used instead of the management API (fixed mode).
    pub service_json_path: Option<PathBuf>,
    /// Service-account key file used to mint access tokens.
    pub service_account_key: Option<PathBuf>,
    pub metadata_url: String,
    pub service_management_url: String,
    /// Extra PEM roots trusted by every outbound client.
    pub root_certs_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub http_request_timeout: Duration,
    /// Node key under which snapshots are published.
    pub node_id: String,
    pub admin_port: Option<u16>,
    pub token_agent_port: Option<u16>,
    pub log_level: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            config_id: None,
            rollout_strategy: None,
            check_metadata: false,
            non_gcp: false,
            service_json_path: None,
            service_account_key: None,
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            service_management_url: DEFAULT_SERVICE_MANAGEMENT_URL.to_string(),
            root_certs_path: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            http_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            node_id: DEFAULT_NODE_ID.to_string(),
            admin_port: None,
            token_agent_port: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl ManagerConfig {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |name: &str| map.get(name).and_then(|value| sanitize_non_empty(value));
        let defaults = Self::default();

        let rollout_strategy = get(ENV_ROLLOUT_STRATEGY)
            .map(|value| value.parse::<RolloutStrategy>())
            .transpose()?;
        let poll_interval = parse_secs(ENV_POLL_INTERVAL_SECS, get(ENV_POLL_INTERVAL_SECS))?
            .unwrap_or(defaults.poll_interval);
        let http_request_timeout = parse_secs(
            ENV_HTTP_REQUEST_TIMEOUT_SECS,
            get(ENV_HTTP_REQUEST_TIMEOUT_SECS),
        )?
        .unwrap_or(defaults.http_request_timeout);

        Ok(Self {
            service_name: get(ENV_SERVICE_NAME),
            config_id: get(ENV_CONFIG_ID),
            rollout_strategy,
            check_metadata: parse_bool(map.get(ENV_CHECK_METADATA).map(String::as_str), false),
            non_gcp: parse_bool(map.get(ENV_NON_GCP).map(String::as_str), false),
            service_json_path: get(ENV_SERVICE_JSON_PATH).map(PathBuf::from),
            service_account_key: get(ENV_SERVICE_ACCOUNT_KEY).map(PathBuf::from),
            metadata_url: get(ENV_METADATA_URL).unwrap_or(defaults.metadata_url),
            service_management_url: get(ENV_SERVICE_MANAGEMENT_URL)
                .unwrap_or(defaults.service_management_url),
            root_certs_path: get(ENV_ROOT_CERTS_PATH).map(PathBuf::from),
            poll_interval,
            http_request_timeout,
            node_id: get(ENV_NODE_ID).unwrap_or(defaults.node_id),
            admin_port: parse_port(ENV_ADMIN_PORT, get(ENV_ADMIN_PORT))?,
            token_agent_port: parse_port(ENV_TOKEN_AGENT_PORT, get(ENV_TOKEN_AGENT_PORT))?,
            log_level: get(ENV_LOG_LEVEL).unwrap_or(defaults.log_level),
        })
    }

    /// Clamps out-of-range durations back to their defaults.
    pub fn sanitise(mut self) -> Self {
        if self.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "poll interval {:?} is below the minimum {:?}; using {:?} instead",
                self.poll_interval, MIN_POLL_INTERVAL, DEFAULT_POLL_INTERVAL
            );
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.http_request_timeout.is_zero() {
            warn!(
                "HTTP request timeout must be positive; using {:?} instead",
                DEFAULT_REQUEST_TIMEOUT
            );
            self.http_request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }
        let trimmed = self.metadata_url.trim_end_matches('/');
        if trimmed.len() != self.metadata_url.len() {
            self.metadata_url = trimmed.to_string();
        }
        let trimmed = self.service_management_url.trim_end_matches('/');
        if trimmed.len() != self.service_management_url.len() {
            self.service_management_url = trimmed.to_string();
        }
        self
    }

    /// Rejects settings that contradict each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.non_gcp && self.service_account_key.is_none() {
            return Err(ConfigError::MissingServiceAccountKey);
        }
        if self.service_json_path.is_some()
            && self.rollout_strategy == Some(RolloutStrategy::Managed)
        {
            return Err(ConfigError::ServiceJsonWithManagedStrategy);
        }
        if self.token_agent_port.is_some() && self.service_account_key.is_none() {
            return Err(ConfigError::TokenAgentWithoutKey);
        }
        if let (Some(admin), Some(agent)) = (self.admin_port, self.token_agent_port) {
            if admin == agent {
                return Err(ConfigError::PortConflict(admin));
            }
        }
        Ok(())
    }

    /// Whether the metadata server may be consulted for identifiers.
    pub(crate) fn metadata_lookup_allowed(&self) -> bool {
        self.check_metadata && !self.non_gcp
    }
}

fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

fn parse_secs(name: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|raw| {
            raw.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue { name, value: raw })
        })
        .transpose()
}

fn parse_port(name: &'static str, value: Option<String>) -> Result<Option<u16>, ConfigError> {
    value
        .map(|raw| {
            raw.parse::<u16>()
                .map_err(|_| ConfigError::InvalidValue { name, value: raw })
        })
        .transpose()
}
