//! Local admin surface: manager status and the published snapshots.
//!
//! `GET /v1/status` returns the committed rollout/config pair and poll
//! counters. `GET /v1/snapshots/{node}` returns the node's current snapshot;
//! with `?version=V` it answers `304 Not Modified` when `V` is current.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::debug;

use crate::manager::ManagerStatus;
use crate::snapshot::{FetchRequest, SnapshotStore, StoreError};

pub const STATUS_PATH: &str = "/v1/status";
pub const SNAPSHOT_PATH: &str = "/v1/snapshots/{node}";

#[derive(Clone)]
struct AdminState {
    status: Arc<ManagerStatus>,
    store: Arc<dyn SnapshotStore>,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotQuery {
    version: Option<String>,
}

pub fn router(status: Arc<ManagerStatus>, store: Arc<dyn SnapshotStore>) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status_handler))
        .route(SNAPSHOT_PATH, get(snapshot_handler))
        .with_state(AdminState { status, store })
}

async fn status_handler(State(state): State<AdminState>) -> Response {
    Json(state.status.to_json().await).into_response()
}

async fn snapshot_handler(
    State(state): State<AdminState>,
    Path(node): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    let mut request = FetchRequest::new(node);
    if let Some(version) = query.version {
        request = request.with_version(version);
    }
    match state.store.fetch(&request).await {
        Ok(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        Err(StoreError::UpToDate { node, version }) => {
            debug!(node, version, "subscriber already holds the current snapshot");
            StatusCode::NOT_MODIFIED.into_response()
        }
        Err(err @ StoreError::UnknownNode(_)) => {
            (StatusCode::NOT_FOUND, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
