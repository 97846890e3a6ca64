//! Endpoint and model constants
//!
//! Model identifiers are the ones the studio was tuned against. The base URL
//! can be overridden in configuration (tests point it at a local mock).

/// Default REST base for the Generative Language API
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Fast text model (titles, grounded search, key validation)
pub const TEXT_FAST_MODEL: &str = "gemini-3-flash-preview";

/// Reasoning text model (storyboards, reports, review material)
pub const TEXT_PRO_MODEL: &str = "gemini-3-pro-preview";

/// Standard-resolution image model
pub const IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// High-resolution (2K/4K) image model
pub const IMAGE_HIRES_MODEL: &str = "gemini-3-pro-image-preview";

/// Text-to-speech model
pub const SPEECH_MODEL: &str = "gemini-2.5-flash-preview-tts";

/// Prebuilt narrator voice
pub const NARRATOR_VOICE: &str = "Puck";

/// PCM sample rate of generated speech (16-bit mono)
pub const SPEECH_SAMPLE_RATE: u32 = 24_000;

/// Image-to-video model
pub const VIDEO_MODEL: &str = "veo-3.1-fast-generate-preview";
