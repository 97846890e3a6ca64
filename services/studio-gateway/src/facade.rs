//! Generation facade
//!
//! One method per studio operation. Each method declares its workload,
//! builds the upstream request and hands a closure to the retrying invoker,
//! which picks the key, binds the client and fails over on quota errors. The
//! facade itself never retries or routes.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::Secret;
use gemini_client::{
    GenerateContentRequest, GenerateContentResponse, GenerationConfig, IMAGE_HIRES_MODEL,
    IMAGE_MODEL, ImageConfig, NARRATOR_VOICE, Part, PollSettings, SPEECH_MODEL,
    SPEECH_SAMPLE_RATE, SpeechConfig, TEXT_FAST_MODEL, TEXT_PRO_MODEL, ThinkingConfig,
    VIDEO_MODEL, VideoImage, VideoInstance, VideoParameters, VideoRequest, WebSource,
};
use gemini_client::{GeminiClient, GeminiClientFactory};
use key_pool::{CredentialSource, FailoverEvent, KeyPool, Result, RetryingInvoker};
use provider::{ClientFactory, ProviderError, Workload};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::error_kind;
use crate::metrics::record_operation;

pub const UNTITLED: &str = "Untitled Experiment";
const MIN_PROTOCOL_CHARS: usize = 10;
const TITLE_CONTEXT_CHARS: usize = 1000;

/// Output resolution for scene images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSize {
    #[default]
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl ImageSize {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSize::OneK => "1K",
            ImageSize::TwoK => "2K",
            ImageSize::FourK => "4K",
        }
    }

    fn is_high_res(self) -> bool {
        !matches!(self, ImageSize::OneK)
    }
}

/// One storyboard scene.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scene {
    pub id: String,
    pub scene_number: u32,
    pub title: String,
    pub visual_prompt: String,
    pub narration_script: String,
}

#[derive(Debug, Deserialize)]
struct SceneDraft {
    scene_number: u32,
    title: String,
    visual_prompt: String,
    narration_script: String,
}

/// Raw 16-bit PCM narration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechClip {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoClip {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub text: String,
    pub sources: Vec<WebSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewRole {
    Educator,
    Student,
}

impl ReviewRole {
    fn as_str(self) -> &'static str {
        match self {
            ReviewRole::Educator => "educator",
            ReviewRole::Student => "student",
        }
    }
}

/// Autogradable quiz question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizItem {
    pub question: String,
    pub options: Vec<String>,
    pub correct_index: u32,
    pub explanation: String,
    pub points: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportType {
    #[default]
    Basic,
    Advanced,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub citation_style: String,
    pub report_type: ReportType,
    pub additional_context: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub citation_style: String,
    pub target_level: Option<String>,
}

/// Base64 file sent alongside a prompt. Named files are listed in the report prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub name: Option<String>,
    pub mime_type: String,
    pub data: String,
}

impl Attachment {
    fn part(&self) -> Part {
        Part::inline(self.mime_type.clone(), self.data.clone())
    }
}

/// Studio operations over the pooled invoker.
pub struct Studio {
    invoker: RetryingInvoker<GeminiClientFactory>,
    video: PollSettings,
}

impl Studio {
    pub fn new(invoker: RetryingInvoker<GeminiClientFactory>, video: PollSettings) -> Self {
        Self { invoker, video }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        self.invoker.pool()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.invoker.subscribe()
    }

    pub async fn reset_pool(&self) {
        self.invoker.reset_pool().await;
    }

    /// Check a caller-supplied key with a one-token ping. Never touches the pool.
    pub async fn validate_key(&self, key: &Secret<String>) -> bool {
        if key.is_blank() {
            return false;
        }
        let request = GenerateContentRequest::text("Ping").with_config(GenerationConfig {
            max_output_tokens: Some(1),
            thinking_config: Some(ThinkingConfig::budget(0)),
            ..GenerationConfig::default()
        });
        let client = self.invoker.factory().bind(key);
        match client.generate_content(TEXT_FAST_MODEL, &request).await {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "key validation failed");
                false
            }
        }
    }

    /// Short project title for a protocol.
    pub async fn suggest_title(&self, source: &CredentialSource, protocol: &str) -> Result<String> {
        self.observe("title", async {
            if protocol.chars().count() < MIN_PROTOCOL_CHARS {
                return Ok(UNTITLED.to_string());
            }
            let excerpt: String = protocol.chars().take(TITLE_CONTEXT_CHARS).collect();
            let request = GenerateContentRequest::text(format!(
                "Suggest a short, professional, 3-5 word scientific project title for this protocol: \"{excerpt}\". Respond with ONLY the title. No quotes."
            ))
            .with_config(GenerationConfig {
                max_output_tokens: Some(15),
                thinking_config: Some(ThinkingConfig::budget(0)),
                ..GenerationConfig::default()
            });

            let response = self
                .generate(Workload::Text, source, TEXT_FAST_MODEL, &request)
                .await?;
            let title = response
                .text()
                .unwrap_or_default()
                .replace(['"', '\''], "")
                .trim()
                .to_string();
            Ok(if title.is_empty() { UNTITLED.to_string() } else { title })
        })
        .await
    }

    /// Break a protocol into storyboard scenes.
    pub async fn parse_storyboard(
        &self,
        source: &CredentialSource,
        protocol: &str,
    ) -> Result<Vec<Scene>> {
        self.observe("storyboard", async {
            if protocol.trim().chars().count() < MIN_PROTOCOL_CHARS {
                return Err(validation("Input too short for scientific analysis."));
            }
            let request = GenerateContentRequest::text(format!(
                "Convert the following laboratory protocol into a high-fidelity visual storyboard for a cinematic instructional video.\nFormat as a JSON array of objects.\nProtocol: {protocol}"
            ))
            .with_config(GenerationConfig {
                thinking_config: Some(ThinkingConfig::budget(4000)),
                response_mime_type: Some("application/json".into()),
                response_schema: Some(storyboard_schema()),
                ..GenerationConfig::default()
            });

            let response = self
                .generate(Workload::Text, source, TEXT_PRO_MODEL, &request)
                .await?;
            let drafts: Vec<SceneDraft> = parse_json_text(&response, "storyboard")?;
            let scenes: Vec<Scene> = drafts
                .into_iter()
                .map(|d| Scene {
                    id: uuid::Uuid::new_v4().to_string(),
                    scene_number: d.scene_number,
                    title: d.title,
                    visual_prompt: d.visual_prompt,
                    narration_script: d.narration_script,
                })
                .collect();
            info!(scenes = scenes.len(), "storyboard parsed");
            Ok(scenes)
        })
        .await
    }

    /// Photorealistic still for a scene, as a PNG data URL.
    pub async fn generate_image(
        &self,
        source: &CredentialSource,
        prompt: &str,
        size: ImageSize,
    ) -> Result<String> {
        self.observe("image", async {
            let model = if size.is_high_res() {
                IMAGE_HIRES_MODEL
            } else {
                IMAGE_MODEL
            };
            let request = GenerateContentRequest::text(format!(
                "Cinematic, highly detailed photorealistic laboratory photography: {prompt}. Natural scientific lighting, 8k resolution, documentary style."
            ))
            .with_config(GenerationConfig {
                image_config: Some(ImageConfig {
                    aspect_ratio: "16:9".into(),
                    image_size: size.is_high_res().then(|| size.as_str().to_string()),
                }),
                ..GenerationConfig::default()
            });

            let response = self.generate(Workload::Image, source, model, &request).await?;
            let inline = response.first_inline_data().ok_or_else(|| {
                generation("Image synthesis engine returned empty response.")
            })?;
            Ok(format!("data:image/png;base64,{}", inline.data))
        })
        .await
    }

    /// Narration audio for a script.
    pub async fn generate_narration(
        &self,
        source: &CredentialSource,
        text: &str,
    ) -> Result<SpeechClip> {
        self.observe("narration", async {
            let request = GenerateContentRequest::text(format!(
                "You are a professional scientific narrator.\nMaintain a consistent, clear, and stable pitch.\nNarrate the following: {text}"
            ))
            .with_config(GenerationConfig {
                response_modalities: Some(vec!["AUDIO".into()]),
                speech_config: Some(SpeechConfig::prebuilt(NARRATOR_VOICE)),
                ..GenerationConfig::default()
            });

            let response = self
                .generate(Workload::Speech, source, SPEECH_MODEL, &request)
                .await?;
            let inline = response
                .first_inline_data()
                .filter(|d| !d.data.is_empty())
                .ok_or_else(|| generation("TTS engine failed to generate voice bytes."))?;
            let pcm = BASE64.decode(&inline.data).map_err(|e| {
                generation(format!("TTS engine returned undecodable audio: {e}"))
            })?;
            Ok(SpeechClip {
                pcm,
                sample_rate: SPEECH_SAMPLE_RATE,
            })
        })
        .await
    }

    /// Animate a scene still into a short clip.
    pub async fn animate_scene(
        &self,
        source: &CredentialSource,
        prompt: &str,
        image_data_url: &str,
    ) -> Result<VideoClip> {
        self.observe("video", async {
            let (mime_type, bytes) = split_data_url(image_data_url)
                .ok_or_else(|| validation("image must be a base64 data URL"))?;
            let request = VideoRequest {
                instances: vec![VideoInstance {
                    prompt: format!(
                        "Smooth cinematic laboratory movement: {prompt}. Subtle focus shifts, realistic fluid motion, 24fps."
                    ),
                    image: Some(VideoImage {
                        bytes_base64_encoded: bytes.to_string(),
                        mime_type: mime_type.to_string(),
                    }),
                }],
                parameters: VideoParameters {
                    aspect_ratio: "16:9".into(),
                    resolution: "1080p".into(),
                    sample_count: 1,
                },
            };
            let request = &request;
            let settings = self.video;

            let bytes = self
                .invoker
                .invoke(Workload::Video, source, move |client: GeminiClient| async move {
                    client.generate_video(VIDEO_MODEL, request, settings).await
                })
                .await?;
            info!(bytes = bytes.len(), "video clip ready");
            Ok(VideoClip {
                bytes,
                mime_type: "video/mp4",
            })
        })
        .await
    }

    /// Search-grounded protocol summary with its web sources.
    pub async fn search_protocol(
        &self,
        source: &CredentialSource,
        query: &str,
    ) -> Result<SearchResult> {
        self.observe("search", async {
            let request = GenerateContentRequest::text(format!(
                "Search professional protocol and detailed scientific procedure for: \"{query}\". Provide a comprehensive summary."
            ))
            .with_google_search();

            let response = self
                .generate(Workload::Search, source, TEXT_FAST_MODEL, &request)
                .await?;
            Ok(SearchResult {
                text: response
                    .text()
                    .unwrap_or_else(|| "No grounded results found.".to_string()),
                sources: response.web_sources(),
            })
        })
        .await
    }

    /// Assessment material: Markdown for educators, JSON questions for students.
    pub async fn review_material(
        &self,
        source: &CredentialSource,
        role: ReviewRole,
        project: &str,
        protocol: &str,
        use_search: bool,
    ) -> Result<String> {
        self.observe("review", async {
            let mut request = GenerateContentRequest::text(format!(
                "Generate {} material for project \"{project}\". Protocol: {protocol}.\nIf student: return a JSON array of objects with question, options[], correctIndex, explanation.\nIf educator: return Markdown assessment paper.",
                role.as_str()
            ))
            .with_config(GenerationConfig {
                thinking_config: Some(ThinkingConfig::budget(2000)),
                response_mime_type: (role == ReviewRole::Student)
                    .then(|| "application/json".to_string()),
                ..GenerationConfig::default()
            });
            if use_search {
                request = request.with_google_search();
            }

            let response = self
                .generate(Workload::Text, source, TEXT_PRO_MODEL, &request)
                .await?;
            Ok(response.text().unwrap_or_default())
        })
        .await
    }

    /// Structured quiz for the educator workspace.
    pub async fn educator_quiz(
        &self,
        source: &CredentialSource,
        project: &str,
        protocol: &str,
    ) -> Result<Vec<QuizItem>> {
        self.observe("quiz", async {
            let request = GenerateContentRequest::text(format!(
                "Analyze this lab protocol and synthesize a structured autogradable quiz for project \"{project}\".\nProtocol: {protocol}\nIMPORTANT: The 'question' string must NOT contain the explanation or answer. The 'explanation' field should contain the reasoning.\nOutput strictly as a JSON array of objects: [{{question, options:[], correct_index, explanation, points}}]."
            ))
            .with_config(GenerationConfig {
                response_mime_type: Some("application/json".into()),
                response_schema: Some(quiz_schema()),
                ..GenerationConfig::default()
            });

            let response = self
                .generate(Workload::Text, source, TEXT_PRO_MODEL, &request)
                .await?;
            parse_json_text(&response, "quiz")
        })
        .await
    }

    /// Markdown lab report, optionally grounded on attached files.
    pub async fn lab_report(
        &self,
        source: &CredentialSource,
        protocol: &str,
        settings: &ReportSettings,
        files: &[Attachment],
    ) -> Result<String> {
        self.observe("report", async {
            if protocol.chars().count() < MIN_PROTOCOL_CHARS {
                return Err(validation("Insufficient protocol data."));
            }
            let mut parts: Vec<Part> = files.iter().map(Attachment::part).collect();
            let mut prompt = format!(
                "Act as Scientific Writer. Generate lab report in Markdown. Report depth: {:?}. Protocol: {protocol}. Context: {}. Citation Style: {}.",
                settings.report_type,
                settings.additional_context.as_deref().unwrap_or_default(),
                settings.citation_style
            );
            let names: Vec<&str> = files.iter().filter_map(|f| f.name.as_deref()).collect();
            if !names.is_empty() {
                debug!(files = ?names, "report attachments");
                prompt.push_str(&format!(" Attached files: {}.", names.join(", ")));
            }
            parts.push(Part::text(prompt));
            let request = GenerateContentRequest::parts(parts).with_config(GenerationConfig {
                thinking_config: Some(ThinkingConfig::budget(4000)),
                ..GenerationConfig::default()
            });

            let response = self
                .generate(Workload::Text, source, TEXT_PRO_MODEL, &request)
                .await?;
            Ok(response
                .text()
                .unwrap_or_else(|| "Report generation failed.".to_string()))
        })
        .await
    }

    /// Educator manual for a protocol, optionally following a template file.
    pub async fn educator_protocol(
        &self,
        source: &CredentialSource,
        protocol: &str,
        settings: &ProtocolSettings,
        template: Option<&Attachment>,
    ) -> Result<String> {
        self.observe("educator_protocol", async {
            let mut parts: Vec<Part> = template.map(Attachment::part).into_iter().collect();
            parts.push(Part::text(format!(
                "Transform into educator manual. Level: {}. Citation Style: {}. Protocol: {protocol}",
                settings.target_level.as_deref().unwrap_or("Undergraduate"),
                settings.citation_style
            )));
            let request = GenerateContentRequest::parts(parts).with_config(GenerationConfig {
                thinking_config: Some(ThinkingConfig::budget(4000)),
                ..GenerationConfig::default()
            });

            let response = self
                .generate(Workload::Text, source, TEXT_PRO_MODEL, &request)
                .await?;
            Ok(response
                .text()
                .unwrap_or_else(|| "Synthesis failed.".to_string()))
        })
        .await
    }

    async fn generate(
        &self,
        workload: Workload,
        source: &CredentialSource,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        self.invoker
            .invoke(workload, source, move |client: GeminiClient| async move {
                client.generate_content(model, request).await
            })
            .await
    }

    async fn observe<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = work.await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => error_kind(err),
        };
        record_operation(operation, outcome, started.elapsed().as_secs_f64());
        result
    }
}

fn validation(message: &str) -> key_pool::Error {
    ProviderError::Validation(message.to_string()).into()
}

fn generation(message: impl Into<String>) -> key_pool::Error {
    ProviderError::Generation(message.into()).into()
}

/// Parse the response text as JSON, treating a missing text as an empty array.
fn parse_json_text<T: DeserializeOwned>(
    response: &GenerateContentResponse,
    what: &str,
) -> Result<T> {
    let text = response.text().unwrap_or_else(|| "[]".to_string());
    serde_json::from_str(&text)
        .map_err(|e| generation(format!("{what} response was not valid JSON: {e}")))
}

/// `data:<mime>;base64,<payload>` → (mime, payload). Mime defaults to PNG.
fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let (header, payload) = url.split_once(',')?;
    if payload.is_empty() {
        return None;
    }
    let mime = header
        .strip_prefix("data:")
        .and_then(|h| h.split(';').next())
        .filter(|m| !m.is_empty())
        .unwrap_or("image/png");
    Some((mime, payload))
}

fn storyboard_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "scene_number": { "type": "INTEGER" },
                "title": { "type": "STRING" },
                "visual_prompt": { "type": "STRING" },
                "narration_script": { "type": "STRING" }
            },
            "required": ["scene_number", "title", "visual_prompt", "narration_script"]
        }
    })
}

fn quiz_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "question": { "type": "STRING" },
                "options": { "type": "ARRAY", "items": { "type": "STRING" } },
                "correct_index": { "type": "INTEGER" },
                "explanation": { "type": "STRING" },
                "points": { "type": "INTEGER" }
            },
            "required": ["question", "options", "correct_index", "explanation", "points"]
        }
    })
}
