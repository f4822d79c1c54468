//! Access tokens minted from a service-account key file.
//!
//! Used outside of GCP where no metadata server exists: a JWT-bearer
//! assertion signed with the key is exchanged at the key's `token_uri`.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};

use super::{Token, TokenError, TokenFetcher, TokenResponse};
use crate::http::HttpClient;

/// Scopes requested for the management and control APIs.
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/service.management.readonly",
    "https://www.googleapis.com/auth/servicecontrol",
];

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// The subset of a service-account JSON key the token flow needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, TokenError> {
        let raw = std::fs::read(path).map_err(|source| TokenError::ReadKey {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, TokenError> {
        let key: ServiceAccountKey =
            serde_json::from_slice(raw).map_err(|err| TokenError::InvalidKey(err.to_string()))?;
        if key.client_email.is_empty() {
            return Err(TokenError::InvalidKey("client_email is empty".into()));
        }
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Exchanges signed assertions for access tokens. Wrap in a
/// [`super::TokenCache`] to reuse tokens until they near expiry.
pub struct ServiceAccountTokenFetcher {
    http: HttpClient,
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    token_url: Url,
    scopes: Vec<String>,
}

impl std::fmt::Debug for ServiceAccountTokenFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountTokenFetcher")
            .field("key", &self.key)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountTokenFetcher {
    pub fn new(http: HttpClient, key: ServiceAccountKey) -> Result<Self, TokenError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
        let token_url = Url::parse(&key.token_uri)
            .map_err(|err| TokenError::InvalidKey(format!("token_uri: {err}")))?;
        Ok(Self {
            http,
            key,
            signing_key,
            token_url,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn assertion(&self) -> Result<String, TokenError> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: self.scopes.join(" "),
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME.as_secs(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        Ok(jsonwebtoken::encode(&header, &claims, &self.signing_key)?)
    }
}

#[async_trait]
impl TokenFetcher for ServiceAccountTokenFetcher {
    async fn fetch_access_token(&self) -> Result<Token, TokenError> {
        let assertion = self.assertion()?;
        let request = self
            .http
            .request(Method::POST, self.token_url.clone())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())]);
        let body = self.http.send(request).await?;
        TokenResponse::parse(&body)
    }
}
