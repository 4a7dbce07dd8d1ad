//! Request and response bodies

use serde::{Deserialize, Serialize};

use crate::backend::{
    GenerationConfig, GenerationKind, GenerationResult, Payload, ProviderKind, ProviderStatus,
    Usage,
};
use crate::gateway::BackendStats;
use crate::queue::{QueueStatus, SchedulerStats};
use crate::response::base64;

/// `POST /v1/generations`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGenerationRequest {
    /// Client-chosen id, so the request can be inspected or cancelled while
    /// the submission is still pending
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: GenerationKind,
    pub prompt: String,
    #[serde(default)]
    pub config: GenerationConfig,
    #[serde(default)]
    pub backend: Option<ProviderKind>,
    /// May only lower the caller's tier priority
    #[serde(default)]
    pub priority: Option<u8>,
}

fn default_kind() -> GenerationKind {
    GenerationKind::Image
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GenerationOutput {
    Image { b64_json: String, mime_type: String },
    Text { text: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub id: String,
    pub created: i64,
    pub backend: ProviderKind,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub output: GenerationOutput,
}

impl GenerationResponse {
    pub fn new(id: String, result: GenerationResult) -> Self {
        let output = match result.payload {
            Payload::Image { bytes, mime } => GenerationOutput::Image {
                b64_json: base64::encode(&bytes),
                mime_type: mime,
            },
            Payload::Text(text) => GenerationOutput::Text { text },
        };

        Self {
            id,
            created: result.created_at.timestamp(),
            backend: result.backend,
            model: result.model,
            seed: result.seed,
            usage: result.usage,
            output,
        }
    }
}

/// `GET /v1/generations/:id`
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStatusResponse {
    pub id: String,
    #[serde(flatten)]
    pub status: QueueStatus,
}

/// `DELETE /v1/generations/:id`
#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub id: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendTelemetry {
    pub backend: ProviderKind,
    #[serde(flatten)]
    pub stats: BackendStats,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub scheduler: SchedulerStats,
    pub providers: Vec<ProviderStatus>,
    pub telemetry: Vec<BackendTelemetry>,
}
