//! HTTP error responses
//!
//! Every failure leaving the public API renders as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use provider::ProviderError;
use tracing::warn;

/// A request failure with its HTTP mapping.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub request_id: String,
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            request_id: new_request_id(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }
}

/// Stable error type name, used in response bodies and metric labels.
pub fn error_kind(err: &key_pool::Error) -> &'static str {
    match err {
        key_pool::Error::EmptyPool | key_pool::Error::MissingCredential(_) => "configuration_error",
        key_pool::Error::Provider(provider) => match provider {
            ProviderError::QuotaExceeded(_) => "quota_exhausted",
            ProviderError::Validation(_) => "invalid_request",
            ProviderError::Auth(_) => "upstream_auth_error",
            ProviderError::Transport(_) => "upstream_error",
            ProviderError::Generation(_) | ProviderError::Unknown(_) => "generation_failed",
        },
    }
}

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "configuration_error" => StatusCode::SERVICE_UNAVAILABLE,
        "quota_exhausted" => StatusCode::TOO_MANY_REQUESTS,
        "invalid_request" => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl From<key_pool::Error> for ApiError {
    fn from(err: key_pool::Error) -> Self {
        let kind = error_kind(&err);
        Self::new(status_for(kind), kind, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = format!("invalid request body: {}", rejection.body_text());
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message);
        }
        Self::invalid_request(message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(
            request_id = %self.request_id,
            status = self.status.as_u16(),
            error_type = self.kind,
            error = %self.message,
            "request failed"
        );
        let body = serde_json::json!({
            "error": {
                "type": self.kind,
                "message": self.message,
                "request_id": self.request_id,
            }
        });
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
