//! Error classification for Generative Language API responses
//!
//! The API reports quota exhaustion as HTTP 429 with a `RESOURCE_EXHAUSTED`
//! status, but some gateways relay it under other codes with only the error
//! envelope intact. An envelope whose `error.status` or `error.message`
//! mentions quota is therefore treated as quota exhaustion regardless of the
//! HTTP status. Other body text is never inspected, since it can echo prompt
//! content back.

use provider::{ErrorClassification, ProviderError};
use serde_json::Value;

/// Substrings that mark an error envelope as quota exhaustion.
const QUOTA_PATTERNS: &[&str] = &["resource_exhausted", "quota"];

fn mentions_quota(body: &str) -> bool {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    ["/error/status", "/error/message"]
        .iter()
        .filter_map(|pointer| parsed.pointer(pointer).and_then(Value::as_str))
        .any(|field| {
            let lower = field.to_lowercase();
            QUOTA_PATTERNS.iter().any(|p| lower.contains(p))
        })
}

/// Classify an upstream failure by HTTP status and response body.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    if status == 429 || mentions_quota(body) {
        return ErrorClassification::QuotaExceeded;
    }
    match status {
        401 | 403 => ErrorClassification::Permanent,
        400 | 404 | 413 | 422 => ErrorClassification::Validation,
        408 | 500..=599 => ErrorClassification::Transport,
        _ => ErrorClassification::Unknown,
    }
}

/// Human-readable message from an error body.
///
/// Prefers `error.message` from the standard JSON envelope and falls back to
/// the raw body, or `<no body>` when it is empty.
pub fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    if let Some(message) = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(|m| m.as_str())
    {
        return message.to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "<no body>".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build the typed error for a non-success response.
pub fn error_from_status(status: u16, body: &str) -> ProviderError {
    let message = format!("upstream returned {status}: {}", error_message(body));
    match classify_status(status, body) {
        ErrorClassification::QuotaExceeded => ProviderError::QuotaExceeded(message),
        ErrorClassification::Permanent => ProviderError::Auth(message),
        ErrorClassification::Validation => ProviderError::Validation(message),
        ErrorClassification::Transport => ProviderError::Transport(message),
        ErrorClassification::Unknown => ProviderError::Unknown(message),
    }
}
