//! HTTP client bound to a single API key

use common::Secret;
use provider::{ClientFactory, ProviderError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::constants::{API_KEY_HEADER, DEFAULT_BASE_URL};
use crate::quota::error_from_status;
use crate::types::{GenerateContentRequest, GenerateContentResponse, VideoOperation, VideoRequest};

/// Produces `GeminiClient`s that share one connection pool.
#[derive(Debug, Clone)]
pub struct GeminiClientFactory {
    http: reqwest::Client,
    base_url: String,
}

impl GeminiClientFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, DEFAULT_BASE_URL)
    }

    /// Point the clients at a different API root (tests, regional endpoints).
    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ClientFactory for GeminiClientFactory {
    type Client = GeminiClient;

    fn bind(&self, secret: &Secret<String>) -> GeminiClient {
        GeminiClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            api_key: secret.clone(),
        }
    }
}

/// One API key's view of the Generative Language API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
}

impl GeminiClient {
    /// `POST models/{model}:generateContent`
    #[instrument(skip_all, fields(model = %model))]
    pub async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let url = format!("{}/models/{model}:generateContent", self.base_url);
        self.post_json(&url, request).await
    }

    /// `POST models/{model}:predictLongRunning`, returns the operation handle.
    #[instrument(skip_all, fields(model = %model))]
    pub async fn start_video(&self, model: &str, request: &VideoRequest) -> Result<VideoOperation> {
        let url = format!("{}/models/{model}:predictLongRunning", self.base_url);
        self.post_json(&url, request).await
    }

    /// `GET {name}` for a long-running operation.
    pub async fn get_operation(&self, name: &str) -> Result<VideoOperation> {
        let url = format!("{}/{}", self.base_url, name.trim_start_matches('/'));
        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, self.api_key.expose().as_str())
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("operation poll failed: {e}")))?;
        read_json(response).await
    }

    /// Fetch a generated asset. The key is sent as a header, never in the URL.
    pub async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(uri)
            .header(API_KEY_HEADER, self.api_key.expose().as_str())
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("download failed: {e}")))?;
        let response = check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport(format!("download read failed: {e}")))?;
        debug!(bytes = bytes.len(), "downloaded asset");
        Ok(bytes.to_vec())
    }

    async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, self.api_key.expose().as_str())
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("request failed: {e}")))?;
        read_json(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    Err(error_from_status(status.as_u16(), &body))
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let response = check_status(response).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ProviderError::Transport(format!("response read failed: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ProviderError::Unknown(format!("invalid response body: {e}")))
}
