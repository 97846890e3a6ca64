//! Provider abstraction for generative backends
//!
//! Defines the vocabulary shared by the key pool and the transport adapters:
//! capability tags used for routing, the typed failure taxonomy that drives
//! failover decisions, and the `ClientFactory` seam that binds a selected
//! secret to a concrete client. Transport crates map their wire-level errors
//! into `ProviderError` so the pool never has to inspect message text.

pub mod capability;

pub use capability::{Capability, ParseCapabilityError, Workload};

use common::Secret;

/// Classification of upstream errors to determine failover strategy.
///
/// Only `QuotaExceeded` is recoverable by switching credentials. Every other
/// class is terminal for the invocation because a different key cannot fix it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Rate or usage limit hit on the credential, failover to the next key
    QuotaExceeded,
    /// Credential rejected for reasons unrelated to quota (401/403)
    Permanent,
    /// Network failure, timeout, or upstream 5xx
    Transport,
    /// Malformed or unsupported request
    Validation,
    /// Not attributable to any of the above (empty payloads, exceeded budgets)
    Unknown,
}

/// Errors returned by a transport adapter for a single remote call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    Generation(String),

    #[error("unexpected upstream error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Map the error onto the failover taxonomy.
    pub fn classification(&self) -> ErrorClassification {
        match self {
            ProviderError::QuotaExceeded(_) => ErrorClassification::QuotaExceeded,
            ProviderError::Auth(_) => ErrorClassification::Permanent,
            ProviderError::Transport(_) => ErrorClassification::Transport,
            ProviderError::Validation(_) => ErrorClassification::Validation,
            ProviderError::Generation(_) | ProviderError::Unknown(_) => {
                ErrorClassification::Unknown
            }
        }
    }

    /// Whether switching to a different credential could make the call succeed.
    pub fn is_quota(&self) -> bool {
        self.classification() == ErrorClassification::QuotaExceeded
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Builds a client bound to one credential.
///
/// The retrying invoker calls `bind` once per attempt with the secret chosen
/// for that attempt, so a failover always runs against a fresh client.
pub trait ClientFactory: Send + Sync {
    type Client: Send;

    fn bind(&self, secret: &Secret<String>) -> Self::Client;
}
