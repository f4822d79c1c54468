//! Token agent: serves the process's access token on the same path the
//! metadata server uses, so a co-located proxy can authenticate its own
//! calls when running outside of GCP.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::warn;

use super::{AccessTokenProvider, TokenResponse};

/// Path served by the agent.
pub const TOKEN_PATH: &str = "/v1/instance/service-accounts/default/token";

/// Builds the agent router around `provider`.
pub fn router(provider: Arc<dyn AccessTokenProvider>) -> Router {
    Router::new()
        .route(TOKEN_PATH, get(token))
        .with_state(provider)
}

async fn token(State(provider): State<Arc<dyn AccessTokenProvider>>) -> Response {
    match provider.access_token().await {
        Ok(token) => Json(TokenResponse {
            access_token: token.value,
            expires_in: token.ttl.as_secs(),
            token_type: None,
        })
        .into_response(),
        Err(err) => {
            warn!(%err, "token agent could not obtain an access token");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("fail to get access token: {err}"),
            )
                .into_response()
        }
    }
}
