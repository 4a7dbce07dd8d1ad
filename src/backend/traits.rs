//! Common traits and types for generation backends

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::error::{AppError, Result};

/// The closed set of backends the broker knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Hosted OpenAI-compatible chat/image API
    OpenAi,
    /// Self-hosted OpenAI-compatible server
    LocalAi,
    /// Multipart image REST API
    Stability,
    /// Queue-based node-graph workflow engine
    ComfyUi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::LocalAi,
        ProviderKind::Stability,
        ProviderKind::ComfyUi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::LocalAi => "localai",
            ProviderKind::Stability => "stability",
            ProviderKind::ComfyUi => "comfyui",
        }
    }

    /// Self-hosted backends may run without a credential
    pub fn is_self_hosted(&self) -> bool {
        matches!(self, ProviderKind::LocalAi | ProviderKind::ComfyUi)
    }

    pub fn supports_text(&self) -> bool {
        matches!(self, ProviderKind::OpenAi | ProviderKind::LocalAi)
    }

}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named use-case mapped to a backend and model in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Image,
    RestrictedImage,
    Chat,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Feature::Image => "image",
            Feature::RestrictedImage => "restricted_image",
            Feature::Chat => "chat",
        })
    }
}

/// What the caller wants generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Image,
    Text,
}

impl GenerationKind {
    /// Feature used for model resolution, given the content class
    pub fn feature(&self, restricted: bool) -> Feature {
        match (self, restricted) {
            (GenerationKind::Text, _) => Feature::Chat,
            (GenerationKind::Image, true) => Feature::RestrictedImage,
            (GenerationKind::Image, false) => Feature::Image,
        }
    }
}

/// Source image for image-to-image requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceImage {
    #[serde(with = "crate::response::base64::serde_bytes")]
    pub data: Vec<u8>,
    /// How far the result may drift from the source (0.0 - 1.0)
    pub strength: f32,
}

/// Sampling and shaping parameters shared by all adapters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Negative prompt (things to avoid)
    #[serde(default)]
    pub negative_prompt: Option<String>,

    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,

    /// Aspect ratio such as "16:9"; derived from width/height when absent
    #[serde(default)]
    pub aspect_ratio: Option<String>,

    /// Random seed for reproducibility
    #[serde(default)]
    pub seed: Option<u64>,

    /// Guidance scale / CFG scale
    #[serde(default)]
    pub guidance_scale: Option<f32>,

    /// Number of inference steps
    #[serde(default)]
    pub steps: Option<u32>,

    #[serde(default)]
    pub sampler: Option<String>,

    /// Content-classification flag used for backend selection
    #[serde(default)]
    pub restricted: bool,

    #[serde(default)]
    pub source_image: Option<SourceImage>,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl GenerationConfig {
    /// Aspect ratio as width over height, if one can be determined
    pub fn ratio(&self) -> Option<f64> {
        if let Some(ratio) = self.aspect_ratio.as_deref() {
            let (w, h) = ratio.split_once(':')?;
            let w: f64 = w.trim().parse().ok()?;
            let h: f64 = h.trim().parse().ok()?;
            return (w > 0.0 && h > 0.0).then_some(w / h);
        }
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(w as f64 / h as f64),
            _ => None,
        }
    }
}

/// Token accounting reported by text backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Generated output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Image { bytes: Vec<u8>, mime: String },
    Text(String),
}

/// Response from any backend
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub payload: Payload,
    pub backend: ProviderKind,
    pub model: String,
    pub seed: Option<u64>,
    pub usage: Option<Usage>,
    pub created_at: DateTime<Utc>,
}

impl GenerationResult {
    pub fn new(payload: Payload, backend: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            payload,
            backend,
            model: model.into(),
            seed: None,
            usage: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }
}

/// Backend-side progress for a single generation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ProgressEvent {
    Submitted { run_id: String },
    Queued,
    Executing { percent: u8 },
    Finalizing,
}

/// Sending half of a progress channel; updates are lossy when the caller lags
pub type ProgressSender = mpsc::Sender<ProgressEvent>;

/// Best-effort delivery of a progress update
pub fn report(progress: Option<&ProgressSender>, event: ProgressEvent) {
    if let Some(tx) = progress {
        let _ = tx.try_send(event);
    }
}

/// Uniform contract every protocol adapter implements
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which backend this adapter speaks to
    fn kind(&self) -> ProviderKind;

    /// Generate an image from a prompt
    async fn generate_image(
        &self,
        prompt: &str,
        model: &str,
        config: &GenerationConfig,
        progress: Option<&ProgressSender>,
    ) -> Result<GenerationResult>;

    /// Generate text from a prompt
    async fn generate_text(
        &self,
        _prompt: &str,
        _model: &str,
        _config: &GenerationConfig,
    ) -> Result<GenerationResult> {
        Err(AppError::InvalidRequest(format!(
            "{} does not generate text",
            self.kind()
        )))
    }

    /// Generate text, sending each delta on `chunks` as it arrives.
    /// Adapters without native streaming deliver the whole text as one chunk.
    async fn generate_text_streaming(
        &self,
        prompt: &str,
        model: &str,
        config: &GenerationConfig,
        chunks: mpsc::Sender<String>,
    ) -> Result<GenerationResult> {
        let result = self.generate_text(prompt, model, config).await?;
        if let Payload::Text(text) = &result.payload {
            let _ = chunks.send(text.clone()).await;
        }
        Ok(result)
    }
}
