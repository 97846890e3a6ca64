//! Error types for pool operations

use provider::{Capability, ProviderError};

/// Errors surfaced by routing and invocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool is empty: no credential records configured")]
    EmptyPool,

    #[error(
        "API key for {} is missing; configure a key for this capability",
        .0.as_str().to_ascii_uppercase()
    )]
    MissingCredential(Capability),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl Error {
    /// Configuration errors: no usable credential exists for the request.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::EmptyPool | Error::MissingCredential(_))
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
