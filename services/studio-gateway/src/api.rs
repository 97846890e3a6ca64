//! Public HTTP API
//!
//! JSON endpoints, one per studio operation, plus health, metrics and the
//! failover event stream. Requests run against the shared key pool unless
//! the caller supplies personal keys in `x-user-api-key*` headers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::Secret;
use futures_util::Stream;
use key_pool::{CredentialSource, PersonalKeys};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::Capability;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::error::ApiError;
use crate::facade::{
    Attachment, ImageSize, ProtocolSettings, ReportSettings, ReviewRole, Studio,
};

/// Primary personal key. `x-user-api-key-{capability}` overrides it per capability.
pub const USER_KEY_HEADER: &str = "x-user-api-key";

/// Shared state for public handlers
#[derive(Clone)]
pub struct AppState {
    pub studio: Arc<Studio>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Build the public router with a concurrency limit of `max_connections`.
///
/// Bodies up to `max_body_bytes` are accepted; axum's 2 MB default is too
/// small for base64 stills and attachments.
pub fn build_router(state: AppState, max_connections: usize, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/events", get(events_handler))
        .route("/v1/validate-key", post(validate_key))
        .route("/v1/title", post(title))
        .route("/v1/storyboard", post(storyboard))
        .route("/v1/image", post(image))
        .route("/v1/narration", post(narration))
        .route("/v1/video", post(video))
        .route("/v1/search", post(search))
        .route("/v1/review", post(review))
        .route("/v1/quiz", post(quiz))
        .route("/v1/report", post(report))
        .route("/v1/educator-protocol", post(educator_protocol))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Pooled mode unless at least one non-blank personal key header is present.
pub fn credential_source(headers: &HeaderMap) -> CredentialSource {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| Secret::from(v.trim()))
    };

    let mut keys = PersonalKeys::new();
    if let Some(secret) = header(USER_KEY_HEADER) {
        keys = keys.with_primary(secret);
    }
    for capability in Capability::ALL {
        if let Some(secret) = header(&format!("{USER_KEY_HEADER}-{capability}")) {
            keys = keys.with_capability(capability, secret);
        }
    }

    if keys.is_empty() {
        CredentialSource::Pooled
    } else {
        CredentialSource::Personal(keys)
    }
}

fn require(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::invalid_request(format!("{field} is required")));
    }
    Ok(())
}

/// 200 while at least one pool key is active, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.studio.pool().health().await;
    let active = pool["keys_active"].as_u64().unwrap_or(0);
    let status_code = if active > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": pool["status"].clone(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "pool": pool,
    });
    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Server-sent `failover` events, one per abandoned key.
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.studio.subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().event("failover").json_data(&event) {
                    Ok(sse) => return Some((Ok(sse), rx)),
                    Err(e) => warn!(error = %e, "failed to encode failover event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct ValidateKeyBody {
    api_key: String,
}

async fn validate_key(
    State(state): State<AppState>,
    payload: Result<Json<ValidateKeyBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let valid = state.studio.validate_key(&Secret::new(body.api_key)).await;
    Ok(Json(json!({ "valid": valid })))
}

#[derive(Deserialize)]
struct ProtocolBody {
    protocol: String,
}

async fn title(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ProtocolBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let title = state
        .studio
        .suggest_title(&credential_source(&headers), &body.protocol)
        .await?;
    Ok(Json(json!({ "title": title })))
}

async fn storyboard(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ProtocolBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let scenes = state
        .studio
        .parse_storyboard(&credential_source(&headers), &body.protocol)
        .await?;
    Ok(Json(json!({ "scenes": scenes })))
}

#[derive(Deserialize)]
struct ImageBody {
    prompt: String,
    #[serde(default)]
    size: ImageSize,
}

async fn image(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ImageBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    require(&body.prompt, "prompt")?;
    let image = state
        .studio
        .generate_image(&credential_source(&headers), &body.prompt, body.size)
        .await?;
    Ok(Json(json!({ "image": image })))
}

#[derive(Deserialize)]
struct NarrationBody {
    text: String,
}

async fn narration(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NarrationBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    require(&body.text, "text")?;
    let clip = state
        .studio
        .generate_narration(&credential_source(&headers), &body.text)
        .await?;
    Ok(Json(json!({
        "audio": BASE64.encode(&clip.pcm),
        "encoding": "pcm_s16le",
        "sample_rate": clip.sample_rate,
    })))
}

#[derive(Deserialize)]
struct VideoBody {
    prompt: String,
    /// Scene still as a base64 data URL
    image: String,
}

async fn video(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<VideoBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    require(&body.prompt, "prompt")?;
    let clip = state
        .studio
        .animate_scene(&credential_source(&headers), &body.prompt, &body.image)
        .await?;
    Ok(Json(json!({
        "video": format!("data:{};base64,{}", clip.mime_type, BASE64.encode(&clip.bytes)),
    })))
}

#[derive(Deserialize)]
struct SearchBody {
    query: String,
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SearchBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    require(&body.query, "query")?;
    let result = state
        .studio
        .search_protocol(&credential_source(&headers), &body.query)
        .await?;
    Ok(Json(json!(result)))
}

#[derive(Deserialize)]
struct ReviewBody {
    role: ReviewRole,
    project: String,
    protocol: String,
    #[serde(default)]
    use_search: bool,
}

async fn review(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ReviewBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let content = state
        .studio
        .review_material(
            &credential_source(&headers),
            body.role,
            &body.project,
            &body.protocol,
            body.use_search,
        )
        .await?;
    Ok(Json(json!({ "content": content })))
}

#[derive(Deserialize)]
struct QuizBody {
    project: String,
    protocol: String,
}

async fn quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<QuizBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let items = state
        .studio
        .educator_quiz(&credential_source(&headers), &body.project, &body.protocol)
        .await?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
struct ReportBody {
    protocol: String,
    #[serde(default)]
    settings: ReportSettings,
    #[serde(default)]
    files: Vec<Attachment>,
}

async fn report(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ReportBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let report = state
        .studio
        .lab_report(
            &credential_source(&headers),
            &body.protocol,
            &body.settings,
            &body.files,
        )
        .await?;
    Ok(Json(json!({ "report": report })))
}

#[derive(Deserialize)]
struct EducatorProtocolBody {
    protocol: String,
    #[serde(default)]
    settings: ProtocolSettings,
    #[serde(default)]
    template: Option<Attachment>,
}

async fn educator_protocol(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<EducatorProtocolBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    require(&body.protocol, "protocol")?;
    let manual = state
        .studio
        .educator_protocol(
            &credential_source(&headers),
            &body.protocol,
            &body.settings,
            body.template.as_ref(),
        )
        .await?;
    Ok(Json(json!({ "manual": manual })))
}
