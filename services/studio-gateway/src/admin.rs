//! Admin API for the key pool
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is never exposed
//! publicly. Secrets are never returned, only labels and status.
//!
//! Endpoints:
//! - GET  /admin/keys              list keys with status and capabilities
//! - PUT  /admin/keys/{id}/status  set one key's status
//! - GET  /admin/pool              pool status summary
//! - POST /admin/pool/reset        mark every key active again

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use key_pool::KeyStatus;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::facade::Studio;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    studio: Arc<Studio>,
}

impl AdminState {
    pub fn new(studio: Arc<Studio>) -> Self {
        Self { studio }
    }
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys))
        .route("/admin/keys/{id}/status", put(set_key_status))
        .route("/admin/pool", get(pool_status))
        .route("/admin/pool/reset", post(reset_pool))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn list_keys(State(state): State<AdminState>) -> impl IntoResponse {
    let keys = state.studio.pool().diagnostics().await;
    json_response(StatusCode::OK, json!({ "keys": keys }))
}

#[derive(Deserialize)]
struct StatusBody {
    status: KeyStatus,
}

/// PUT /admin/keys/{id}/status with `{"status":"active"|"exhausted"|"error"}`.
async fn set_key_status(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    payload: Result<Json<StatusBody>, JsonRejection>,
) -> impl IntoResponse {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("invalid request body: {}", rejection.body_text()) }),
            );
        }
    };

    if !state.studio.pool().set_status(&id, body.status).await {
        return json_response(
            StatusCode::NOT_FOUND,
            json!({ "error": format!("unknown key: {id}") }),
        );
    }

    info!(key_id = id, status = body.status.label(), "key status set by admin");
    json_response(StatusCode::OK, json!({ "id": id, "status": body.status }))
}

/// GET /admin/pool, same shape as the pool object in `/health`.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.studio.pool().health().await)
}

async fn reset_pool(State(state): State<AdminState>) -> impl IntoResponse {
    state.studio.reset_pool().await;
    info!("key pool reset by admin");
    json_response(StatusCode::OK, state.studio.pool().health().await)
}
