//! Generative Language API transport adapter
//!
//! Thin async client for the Gemini REST endpoints used by the studio:
//! `generateContent` for text, image and speech, and the long-running
//! `predictLongRunning` operation for video. Every failure is mapped into
//! `provider::ProviderError` at this boundary, so callers route on a typed
//! classification instead of inspecting messages.
//!
//! Call flow:
//! 1. `GeminiClientFactory::bind()` pairs the shared HTTP client with one API key
//! 2. `GeminiClient::generate_content()` for single-shot calls
//! 3. `GeminiClient::start_video()` → `wait_for_video()` → `download()` for clips

pub mod client;
pub mod constants;
pub mod quota;
pub mod types;
pub mod video;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use client::{GeminiClient, GeminiClientFactory};
pub use constants::*;
pub use quota::{classify_status, error_from_status, error_message};
pub use types::*;
pub use video::PollSettings;
