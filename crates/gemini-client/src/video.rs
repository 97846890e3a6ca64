//! Long-running video generation
//!
//! Video requests return an operation handle immediately. The handle is
//! polled at a fixed interval until it reports `done` or the overall budget
//! runs out, then the first generated sample is downloaded.

use std::time::Duration;

use provider::{ProviderError, Result};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::GeminiClient;
use crate::quota::error_from_status;
use crate::types::{VideoOperation, VideoRequest};

/// Polling cadence and overall budget for one video operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
        }
    }
}

impl GeminiClient {
    /// Poll `operation` until it completes and return the URI of the first sample.
    pub async fn wait_for_video(
        &self,
        mut operation: VideoOperation,
        settings: PollSettings,
    ) -> Result<String> {
        let started = Instant::now();
        let mut polls = 0u32;
        while !operation.done {
            if started.elapsed() >= settings.timeout {
                return Err(ProviderError::Generation(format!(
                    "video generation timed out after {}s",
                    settings.timeout.as_secs()
                )));
            }
            tokio::time::sleep(settings.interval).await;
            polls += 1;
            operation = self.get_operation(&operation.name).await?;
            debug!(operation = %operation.name, polls, done = operation.done, "polled video operation");
        }

        if let Some(error) = &operation.error {
            let message = error.message.clone().unwrap_or_default();
            return Err(match error.code {
                // Same envelope as an HTTP error body
                Some(code) => error_from_status(
                    code,
                    &serde_json::json!({ "error": { "message": message } }).to_string(),
                ),
                None => ProviderError::Generation(format!("video generation failed: {message}")),
            });
        }

        let uri = operation
            .samples()
            .iter()
            .find_map(|s| s.video.as_ref().and_then(|v| v.uri.clone()))
            .ok_or_else(|| {
                ProviderError::Generation("video generation finished without a clip".to_string())
            })?;
        info!(polls, elapsed_ms = started.elapsed().as_millis() as u64, "video ready");
        Ok(uri)
    }

    /// Start, wait for and download one clip.
    pub async fn generate_video(
        &self,
        model: &str,
        request: &VideoRequest,
        settings: PollSettings,
    ) -> Result<Vec<u8>> {
        let operation = self.start_video(model, request).await?;
        let uri = self.wait_for_video(operation, settings).await?;
        self.download(&uri).await
    }
}
