//! Multipart image generation backend (Stability-style REST API)

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::backend::http::{self, authorize, map_send_error};
use crate::backend::traits::{
    report, GenerationConfig, GenerationResult, Payload, ProgressEvent, ProgressSender,
    ProviderAdapter, ProviderKind,
};
use crate::config::ProviderConfig;
use crate::error::{AppError, Result};
use crate::response::base64;

/// Aspect ratios the API accepts, widest first
const SUPPORTED_ASPECT_RATIOS: [(&str, f64); 9] = [
    ("21:9", 21.0 / 9.0),
    ("16:9", 16.0 / 9.0),
    ("3:2", 3.0 / 2.0),
    ("5:4", 5.0 / 4.0),
    ("1:1", 1.0),
    ("4:5", 4.0 / 5.0),
    ("2:3", 2.0 / 3.0),
    ("9:16", 9.0 / 16.0),
    ("9:21", 9.0 / 21.0),
];

/// Multipart REST client
pub struct StabilityBackend {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StabilityResponse {
    image: Option<String>,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    finish_reason: Option<String>,
}

/// Which generation route serves a model, and whether the model is sent as a field
fn route_for_model(model: &str) -> (&'static str, bool) {
    let lowered = model.to_lowercase();
    if lowered.contains("ultra") {
        ("/v2beta/stable-image/generate/ultra", false)
    } else if lowered == "core" || lowered.ends_with("-core") {
        ("/v2beta/stable-image/generate/core", false)
    } else {
        ("/v2beta/stable-image/generate/sd3", true)
    }
}

/// Snap an arbitrary width/height ratio to the closest supported one
pub fn nearest_aspect_ratio(ratio: f64) -> &'static str {
    if !ratio.is_finite() || ratio <= 0.0 {
        return "1:1";
    }
    let target = ratio.ln();
    SUPPORTED_ASPECT_RATIOS
        .iter()
        .min_by(|(_, a), (_, b)| {
            (a.ln() - target)
                .abs()
                .total_cmp(&(b.ln() - target).abs())
        })
        .map(|(name, _)| *name)
        .unwrap_or("1:1")
}

impl StabilityBackend {
    /// Create a new backend from configuration
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            AppError::ProviderMisconfigured("stability has no endpoint configured".to_string())
        })?;

        Ok(Self {
            client: http::build_client(config.timeout_ms)?,
            endpoint: http::base_url(endpoint),
            api_key: config.api_key.clone(),
        })
    }

    fn build_form(&self, prompt: &str, model: &str, config: &GenerationConfig) -> Result<Form> {
        let (_, send_model) = route_for_model(model);
        let mut form = Form::new()
            .text("prompt", prompt.to_string())
            .text("output_format", "png");

        if send_model {
            form = form.text("model", model.to_string());
        }
        if let Some(negative) = config.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
            form = form.text("negative_prompt", negative.to_string());
        }
        if let Some(seed) = config.seed {
            form = form.text("seed", seed.to_string());
        }
        if let Some(cfg) = config.guidance_scale.filter(|_| send_model) {
            form = form.text("cfg_scale", cfg.to_string());
        }

        match &config.source_image {
            Some(source) => {
                let mime = base64::sniff_image_mime(&source.data).unwrap_or("image/png");
                let part = Part::bytes(source.data.clone())
                    .file_name("source")
                    .mime_str(mime)
                    .map_err(|e| AppError::InvalidRequest(format!("Invalid source image: {}", e)))?;
                form = form
                    .part("image", part)
                    .text("strength", source.strength.clamp(0.0, 1.0).to_string());
                if send_model {
                    form = form.text("mode", "image-to-image");
                }
            }
            None => {
                let aspect_ratio = nearest_aspect_ratio(config.ratio().unwrap_or(1.0));
                form = form.text("aspect_ratio", aspect_ratio);
                if send_model {
                    form = form.text("mode", "text-to-image");
                }
            }
        }

        Ok(form)
    }
}

#[async_trait]
impl ProviderAdapter for StabilityBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stability
    }

    async fn generate_image(
        &self,
        prompt: &str,
        model: &str,
        config: &GenerationConfig,
        progress: Option<&ProgressSender>,
    ) -> Result<GenerationResult> {
        let (path, _) = route_for_model(model);
        let url = format!("{}{}", self.endpoint, path);
        let form = self.build_form(prompt, model, config)?;

        debug!(backend = "stability", url = %url, model = %model, "Sending multipart generate request");

        let response = authorize(self.client.post(&url), self.api_key.as_deref())
            .header(header::ACCEPT, "application/json")
            .multipart(form)
            .send()
            .await
            .map_err(|e| map_send_error(&self.endpoint, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_response(status, &body));
        }

        let body: StabilityResponse = response.json().await?;
        if body.finish_reason.as_deref() == Some("CONTENT_FILTERED") {
            return Err(AppError::ContentRejected(
                "the image was blocked by the provider's safety filter".to_string(),
            ));
        }
        let encoded = body.image.ok_or_else(|| AppError::Upstream {
            status: 200,
            message: "response contained no image".to_string(),
        })?;

        report(progress, ProgressEvent::Finalizing);
        let bytes = base64::decode(&encoded)?;
        let mime = base64::sniff_image_mime(&bytes).unwrap_or("image/png").to_string();

        Ok(GenerationResult::new(Payload::Image { bytes, mime }, ProviderKind::Stability, model)
            .with_seed(body.seed.or(config.seed)))
    }
}

/// Join the structured `errors` array, falling back to other message fields
fn collect_errors(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return http::truncate(body);
    };
    match value.get("errors").and_then(Value::as_array) {
        Some(errors) if !errors.is_empty() => {
            let joined: Vec<&str> = errors.iter().filter_map(Value::as_str).collect();
            http::truncate(&joined.join("; "))
        }
        _ => http::error_message(body),
    }
}

/// Rewrite known failure signatures into caller-facing categories
fn map_error_response(status: StatusCode, body: &str) -> AppError {
    let message = collect_errors(body);
    let lowered = format!("{} {}", message, body).to_lowercase();

    if status == StatusCode::PAYMENT_REQUIRED || lowered.contains("insufficient credits") {
        return AppError::ProviderMisconfigured(
            "the image service account has insufficient credits".to_string(),
        );
    }
    if lowered.contains("safety") || lowered.contains("content_moderation") || lowered.contains("moderation") {
        return AppError::ContentRejected(
            "the prompt was flagged by the provider's safety filter".to_string(),
        );
    }
    if status == StatusCode::TOO_MANY_REQUESTS || lowered.contains("rate limit") {
        return AppError::UpstreamRateLimited(message);
    }
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) || lowered.contains("authorization") {
        return AppError::ProviderMisconfigured(format!("credentials were rejected: {}", message));
    }
    http::status_error(status, message)
}
