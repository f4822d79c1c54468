//! HTTP plumbing shared by the metadata, OAuth and management API clients.
//!
//! Every outbound call goes through [`HttpClient::send`], which logs the
//! request with sensitive headers redacted and turns any non-success status
//! into [`HttpError::Status`]. Callers decide how to decode the body.

use std::path::PathBuf;
use std::time::Duration;

use config_manager_fips::{create_reqwest_client_builder, TlsSetupError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

/// Default per-request deadline; bounds in-flight calls during shutdown.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced by the HTTP layer.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Transport-level issue (DNS, TLS, socket, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server answered with a non-success status code.
    #[error("http call to {url} returns not 200 OK: {status}")]
    Status { url: String, status: StatusCode },
    /// A text response was not valid UTF-8.
    #[error("response from {url} is not valid UTF-8")]
    NotUtf8 { url: String },
    /// The URL could not be built from the configured base.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// A header value contained characters HTTP does not allow.
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),
    /// TLS configuration of the underlying client failed.
    #[error(transparent)]
    Tls(#[from] TlsSetupError),
}

impl HttpError {
    /// Returns the HTTP status when the failure was a non-success response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::Transport(err) => err.status(),
            _ => None,
        }
    }
}

/// Options governing how the shared client is constructed.
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    /// Deadline applied to every request.
    pub request_timeout: Duration,
    /// Optional PEM bundle trusted in addition to the default roots.
    pub root_certs_path: Option<PathBuf>,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            root_certs_path: None,
            user_agent: format!("apiproxy-config-manager/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Thin wrapper around a reusable `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client using the workspace TLS adapter.
    pub fn new(options: &HttpClientOptions) -> Result<Self, HttpError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&options.user_agent)
                .map_err(|_| HttpError::InvalidHeader("user-agent"))?,
        );
        let client = create_reqwest_client_builder(options.root_certs_path.as_deref())?
            .timeout(options.request_timeout)
            .default_headers(default_headers)
            .build()?;
        Ok(Self { client })
    }

    /// Starts a request; finish it with [`HttpClient::send`].
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Sends the request and returns the body of a successful response.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Vec<u8>, HttpError> {
        self.execute(builder).await.map(|(_, body)| body)
    }

    /// Sends the request and returns the body as text.
    pub async fn send_text(&self, builder: RequestBuilder) -> Result<String, HttpError> {
        let (url, body) = self.execute(builder).await?;
        String::from_utf8(body).map_err(|_| HttpError::NotUtf8 { url })
    }

    /// Returns the final request URL alongside the body of a successful response.
    async fn execute(&self, builder: RequestBuilder) -> Result<(String, Vec<u8>), HttpError> {
        let request = builder.build()?;
        let method = request.method().clone();
        let url = request.url().to_string();
        debug!(
            method = %method,
            url = %url,
            headers = ?redact_headers(request.headers()),
            "config-manager HTTP request"
        );

        let response = self.client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            debug!(
                method = %method,
                url = %url,
                status = %status,
                body = %truncate_preview(&String::from_utf8_lossy(&body)),
                "config-manager HTTP response"
            );
            return Err(HttpError::Status { url, status });
        }

        let body = response.bytes().await?;
        debug!(
            method = %method,
            url = %url,
            status = %status,
            body_len = body.len(),
            "config-manager HTTP response"
        );
        Ok((url, body.to_vec()))
    }
}

/// Formats `Bearer <token>` as a header value.
pub fn bearer(token: &str) -> Result<HeaderValue, HttpError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| HttpError::InvalidHeader("authorization"))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Joins `segments` onto `base`, percent-encoding each segment.
pub fn join_segments(base: &str, segments: &[&str]) -> Result<Url, HttpError> {
    let mut url = Url::parse(base).map_err(|err| HttpError::InvalidUrl(format!("{base}: {err}")))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| HttpError::InvalidUrl(base.to_string()))?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Ok(url)
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [HeaderName; 1] = [AUTHORIZATION];

    headers
        .iter()
        .map(|(name, value)| {
            let display = if SENSITIVE_HEADERS.contains(name) || value.is_sensitive() {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (name.as_str().to_string(), display)
        })
        .collect()
}

fn truncate_preview(text: &str) -> String {
    const MAX_CHARS: usize = 512;
    let mut chars = text.chars();
    let mut preview: String = chars.by_ref().take(MAX_CHARS).collect();
    if chars.next().is_some() {
        preview.push('…');
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::request;
    use httptest::{responders::status_code, Expectation, Server};

    fn client() -> HttpClient {
        HttpClient::new(&HttpClientOptions::default()).expect("client")
    }

    #[test]
    fn authorization_is_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer("secret").expect("header"));
        headers.insert("metadata-flavor", HeaderValue::from_static("Google"));
        let redacted = redact_headers(&headers);
        assert!(redacted.contains(&("authorization".to_string(), "<redacted>".to_string())));
        assert!(redacted.contains(&("metadata-flavor".to_string(), "Google".to_string())));
    }

    #[test]
    fn join_segments_encodes_and_keeps_base_path() {
        let url = join_segments(
            "http://127.0.0.1:8080/computeMetadata/",
            &["v1", "services", "a b/c"],
        )
        .expect("url");
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8080/computeMetadata/v1/services/a%20b%2Fc"
        );
    }

    #[test]
    fn join_segments_rejects_garbage_base() {
        assert!(matches!(
            join_segments("not a url", &["v1"]),
            Err(HttpError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/missing"))
                .respond_with(status_code(404).body("nope")),
        );
        let url = Url::parse(&server.url_str("/missing")).expect("url");
        let client = client();
        let err = client
            .send(client.request(Method::GET, url))
            .await
            .expect_err("404 must fail");
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(err.to_string().contains("returns not 200 OK"));
    }

    #[tokio::test]
    async fn send_text_returns_body() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/text"))
                .respond_with(status_code(200).body("hello")),
        );
        let url = Url::parse(&server.url_str("/text")).expect("url");
        let client = client();
        let body = client
            .send_text(client.request(Method::GET, url))
            .await
            .expect("body");
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn invalid_utf8_names_the_url() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/binary"))
                .respond_with(status_code(200).body(vec![0xff, 0xfe, 0x00])),
        );
        let url = Url::parse(&server.url_str("/binary")).expect("url");
        let client = client();
        let err = client
            .send_text(client.request(Method::GET, url))
            .await
            .expect_err("invalid utf-8 must fail");
        match err {
            HttpError::NotUtf8 { url } => assert!(url.ends_with("/binary"), "{url}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn preview_is_truncated() {
        let preview = truncate_preview(&"a".repeat(600));
        assert!(preview.ends_with('…'));
        assert_eq!(preview.chars().count(), 513);
    }
}
