//! Short-lived credentials used to authenticate upstream calls.
//!
//! Tokens come from a [`TokenFetcher`] (the instance metadata server, or a
//! service-account key outside of GCP) and are cached by [`TokenCache`] until
//! shortly before they expire.

pub mod agent;
pub mod cache;
pub mod service_account;

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::http::HttpError;

pub use cache::TokenCache;
pub use service_account::{ServiceAccountKey, ServiceAccountTokenFetcher};

/// Failures while obtaining a credential.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("fail to fetch token: {0}")]
    Http(#[from] HttpError),
    #[error("fail to unmarshal token response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("token response carried an empty access token")]
    EmptyToken,
    #[error("fail to read service account key {path}: {source}")]
    ReadKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid service account key: {0}")]
    InvalidKey(String),
    #[error("fail to sign token assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("{0} tokens are not supported by this credential source")]
    Unsupported(&'static str),
}

/// A credential as handed to callers: the opaque value plus its remaining lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub ttl: Duration,
}

impl Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// OAuth-style token body shared by the metadata server and token endpoints.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub(crate) fn parse(body: &[u8]) -> Result<Token, TokenError> {
        let response: TokenResponse = serde_json::from_slice(body).map_err(TokenError::Decode)?;
        if response.access_token.is_empty() {
            return Err(TokenError::EmptyToken);
        }
        Ok(Token {
            value: response.access_token,
            ttl: Duration::from_secs(response.expires_in),
        })
    }
}

/// Network side of a token source. Every call performs I/O; caching lives in
/// [`TokenCache`].
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Fetches the default access token, returning it with its `expires_in`.
    async fn fetch_access_token(&self) -> Result<Token, TokenError>;

    /// Fetches an identity token for `audience`.
    async fn fetch_identity_token(&self, _audience: &str) -> Result<Token, TokenError> {
        Err(TokenError::Unsupported("identity"))
    }
}

/// Anything able to hand out a bearer token for the management API.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<Token, TokenError>;
}

/// Monotonic time source; swapped for [`ManualClock`] in expiry tests.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut offset = match self.offset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = match self.offset.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        self.start + offset
    }
}
