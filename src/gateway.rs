//! Gemini-backed model gateway. All upstream failures surface as a typed
//! [`GatewayError`]; a safety-blocked image generation is `Ok(None)`, not an
//! error, because the caller has a dedicated recovery protocol for it.
use crate::config::Config;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transient upstream error ({status}): {detail}")]
    Transient { status: u16, detail: String },
    #[error("upstream error ({status}): {detail}")]
    Upstream { status: u16, detail: String },
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient { .. })
    }
}

/// One turn of a text conversation sent to the model.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Free-form text generation. Errors are explicit; callers decide whether
    /// a failure is fatal for their stage.
    async fn generate_text(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, GatewayError>;

    /// Image generation with relaxed safety filtering. `Ok(None)` means the
    /// request was safety-blocked. Transient upstream failures are retried
    /// internally up to `retries` attempts with linear backoff.
    async fn generate_image(
        &self,
        prompt: &str,
        retries: u32,
    ) -> Result<Option<Vec<u8>>, GatewayError>;

    /// Send raw audio bytes inline with a text instruction in a single call.
    /// No chunking; callers are expected to stay under the inline size
    /// ceiling (tens of MB).
    async fn transcribe_audio(
        &self,
        audio: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, GatewayError>;
}

#[derive(Clone)]
pub struct GeminiGateway {
    http: Client,
    api_base: String,
    api_key: String,
    text_model: String,
    image_model: String,
}

impl std::fmt::Debug for GeminiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiGateway")
            .field("api_base", &self.api_base)
            .field("text_model", &self.text_model)
            .field("image_model", &self.image_model)
            .finish_non_exhaustive()
    }
}

impl GeminiGateway {
    pub fn from_config(cfg: &Config) -> Self {
        let http = Client::builder()
            .user_agent("storyloom/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_base: cfg.gemini.api_base.trim_end_matches('/').to_string(),
            api_key: cfg.gemini.api_key.clone(),
            text_model: cfg.gemini.text_model.clone(),
            image_model: cfg.gemini.image_model.clone(),
        }
    }

    fn model_url(&self, model: &str, action: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.api_base, model, action, self.api_key
        )
    }

    async fn generate_content(&self, request: &GenerateRequest) -> Result<String, GatewayError> {
        let url = self.model_url(&self.text_model, "generateContent");
        let res = self.http.post(&url).json(request).send().await?;
        let status = res.status();
        if !status.is_success() {
            let detail = res.text().await.unwrap_or_default();
            return Err(classify_status(status, detail));
        }
        let body: GenerateResponse = res.json().await?;
        let text: String = body
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(GatewayError::InvalidResponse(
                "no text candidate in response".to_string(),
            ));
        }
        Ok(text)
    }
}

fn classify_status(status: StatusCode, detail: String) -> GatewayError {
    match status.as_u16() {
        429 | 500 | 503 => GatewayError::Transient {
            status: status.as_u16(),
            detail,
        },
        _ => GatewayError::Upstream {
            status: status.as_u16(),
            detail,
        },
    }
}

/// Linear backoff schedule for transient image-generation failures.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs((2 * attempt as u64) + 2)
}

#[async_trait]
impl ModelGateway for GeminiGateway {
    #[instrument(skip_all)]
    async fn generate_text(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, GatewayError> {
        let request = GenerateRequest {
            contents: messages
                .iter()
                .map(|m| Content {
                    role: m.role.clone(),
                    parts: vec![Part::text(&m.content)],
                })
                .collect(),
            generation_config: Some(GenerationConfig { temperature }),
        };
        self.generate_content(&request).await
    }

    #[instrument(skip_all, fields(prompt_head = %prompt.chars().take(50).collect::<String>()))]
    async fn generate_image(
        &self,
        prompt: &str,
        retries: u32,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        let url = self.model_url(&self.image_model, "predict");
        let request = ImageRequest {
            instances: vec![ImageInstance {
                prompt: prompt.to_string(),
            }],
            parameters: ImageParameters {
                sample_count: 1,
                aspect_ratio: "1:1".to_string(),
                // Block only high-confidence violations to cut false
                // positives on benign children's-book content.
                safety_filter_level: "block_only_high".to_string(),
                person_generation: "allow_adult".to_string(),
            },
        };

        let mut attempt = 0u32;
        loop {
            let res = self.http.post(&url).json(&request).send().await?;
            let status = res.status();
            if !status.is_success() {
                let detail = res.text().await.unwrap_or_default();
                let err = classify_status(status, detail);
                if err.is_transient() {
                    attempt += 1;
                    if attempt >= retries {
                        warn!(%status, attempt, "image generation exhausted transient retries");
                        return Err(err);
                    }
                    let delay = backoff_delay(attempt);
                    warn!(%status, attempt, ?delay, "image generation rate limited; backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(err);
            }

            let body: ImageResponse = res.json().await?;
            let Some(prediction) = body.predictions.unwrap_or_default().into_iter().next()
            else {
                // Empty result set is the safety filter declining to draw.
                warn!("image generation blocked by safety filter");
                return Ok(None);
            };
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(prediction.bytes_base64_encoded.as_bytes())
                .map_err(|e| GatewayError::InvalidResponse(format!("bad image base64: {e}")))?;
            return Ok(Some(bytes));
        }
    }

    #[instrument(skip_all, fields(bytes = audio.len(), mime = %mime_type))]
    async fn transcribe_audio(
        &self,
        audio: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, GatewayError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        // Audio context first, then the instruction.
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![
                    Part {
                        text: None,
                        inline_data: Some(InlineData {
                            mime_type: mime_type.to_string(),
                            data: encoded,
                        }),
                    },
                    Part::text(prompt),
                ],
            }],
            generation_config: None,
        };
        self.generate_content(&request).await
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(content: &str) -> Self {
        Self {
            text: Some(content.to_string()),
            inline_data: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageRequest {
    instances: Vec<ImageInstance>,
    parameters: ImageParameters,
}

#[derive(Debug, Serialize)]
struct ImageInstance {
    prompt: String,
}

#[derive(Debug, Serialize)]
struct ImageParameters {
    #[serde(rename = "sampleCount")]
    sample_count: u32,
    #[serde(rename = "aspectRatio")]
    aspect_ratio: String,
    #[serde(rename = "safetyFilterLevel")]
    safety_filter_level: String,
    #[serde(rename = "personGeneration")]
    person_generation: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    predictions: Option<Vec<ImagePrediction>>,
}

#[derive(Debug, Deserialize)]
struct ImagePrediction {
    #[serde(rename = "bytesBase64Encoded")]
    bytes_base64_encoded: String,
}
