//! OpenAI-compatible chat completions backend
//!
//! Serves both text and image features: images come back embedded in the
//! first completion as a base64 payload, a data URI, or a remote URL.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::http::{self, authorize, map_send_error};
use crate::backend::traits::{
    report, GenerationConfig, GenerationResult, Payload, ProgressEvent, ProgressSender,
    ProviderAdapter, ProviderKind, Usage,
};
use crate::config::ProviderConfig;
use crate::error::{AppError, Result};
use crate::response::base64;

/// HTTP client for OpenAI-style `/chat/completions` servers
pub struct OpenAiBackend {
    kind: ProviderKind,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ImageOptions {
    aspect_ratio: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modalities: Option<[&'static str; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_config: Option<ImageOptions>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

/// An image reference found in a completion, in preference order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageRef {
    Base64(String),
    DataUri(String),
    Url(String),
}

impl OpenAiBackend {
    /// Create a new backend from configuration
    pub fn new(kind: ProviderKind, config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            AppError::ProviderMisconfigured(format!("{} has no endpoint configured", kind))
        })?;

        Ok(Self {
            kind,
            client: http::build_client(config.timeout_ms)?,
            endpoint: http::base_url(endpoint),
            api_key: config.api_key.clone(),
        })
    }

    fn build_request<'a>(
        &self,
        prompt: &str,
        model: &'a str,
        config: &GenerationConfig,
        image: bool,
        stream: bool,
    ) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = config.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ChatMessage {
                role: "system",
                content: system.to_string(),
            });
        }

        let content = match config.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
            Some(negative) if image => format!("{}\n\nAvoid: {}", prompt, negative),
            _ => prompt.to_string(),
        };
        messages.push(ChatMessage {
            role: "user",
            content,
        });

        ChatRequest {
            model,
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            seed: config.seed,
            modalities: image.then_some(["image", "text"]),
            image_config: if image {
                config.aspect_ratio.clone().map(|aspect_ratio| ImageOptions { aspect_ratio })
            } else {
                None
            },
            stream,
        }
    }

    async fn post_completion(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.endpoint);
        debug!(backend = %self.kind, model = %body.model, stream = body.stream, "Sending completion request");

        let response = authorize(self.client.post(&url), self.api_key.as_deref())
            .json(body)
            .send()
            .await
            .map_err(|e| map_send_error(&self.endpoint, e))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(map_error_response(status, &text))
    }

    /// Turn an image reference into bytes, downloading remote URLs
    async fn resolve_image(&self, image: ImageRef) -> Result<(Vec<u8>, String)> {
        match image {
            ImageRef::Base64(encoded) => {
                let bytes = base64::decode(&encoded)?;
                let mime = base64::sniff_image_mime(&bytes).unwrap_or("image/png").to_string();
                Ok((bytes, mime))
            }
            ImageRef::DataUri(uri) => {
                let bytes = base64::decode(&uri)?;
                let mime = base64::media_type_of_data_uri(&uri)
                    .or_else(|| base64::sniff_image_mime(&bytes))
                    .unwrap_or("image/png")
                    .to_string();
                Ok((bytes, mime))
            }
            ImageRef::Url(url) => {
                debug!(backend = %self.kind, url = %url, "Downloading generated image");
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| map_send_error(&url, e))?;
                if !response.status().is_success() {
                    let status = response.status();
                    return Err(http::status_error(
                        status,
                        format!("image download from {} failed", url),
                    ));
                }
                let header_mime = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| v.starts_with("image/"))
                    .map(str::to_string);
                let bytes = response.bytes().await?.to_vec();
                let mime = header_mime
                    .or_else(|| base64::sniff_image_mime(&bytes).map(str::to_string))
                    .unwrap_or_else(|| "image/png".to_string());
                Ok((bytes, mime))
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiBackend {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn generate_image(
        &self,
        prompt: &str,
        model: &str,
        config: &GenerationConfig,
        progress: Option<&ProgressSender>,
    ) -> Result<GenerationResult> {
        let body = self.build_request(prompt, model, config, true, false);
        let response: Value = self.post_completion(&body).await?.json().await?;

        let image = extract_image_ref(&response).ok_or_else(|| {
            let text = extract_text(&response).unwrap_or_default();
            if refusal(&response).is_some() {
                AppError::ContentRejected(http::truncate(&text))
            } else {
                AppError::Upstream {
                    status: 200,
                    message: format!("completion contained no image: {}", http::truncate(&text)),
                }
            }
        })?;

        report(progress, ProgressEvent::Finalizing);
        let (bytes, mime) = self.resolve_image(image).await?;

        Ok(GenerationResult::new(Payload::Image { bytes, mime }, self.kind, model)
            .with_seed(config.seed)
            .with_usage(extract_usage(&response)))
    }

    async fn generate_text(
        &self,
        prompt: &str,
        model: &str,
        config: &GenerationConfig,
    ) -> Result<GenerationResult> {
        let body = self.build_request(prompt, model, config, false, false);
        let response: Value = self.post_completion(&body).await?.json().await?;

        if let Some(reason) = refusal(&response) {
            return Err(AppError::ContentRejected(reason));
        }
        let text = extract_text(&response).ok_or_else(|| AppError::Upstream {
            status: 200,
            message: "completion contained no text".to_string(),
        })?;

        Ok(GenerationResult::new(Payload::Text(text), self.kind, model)
            .with_usage(extract_usage(&response)))
    }

    async fn generate_text_streaming(
        &self,
        prompt: &str,
        model: &str,
        config: &GenerationConfig,
        chunks: mpsc::Sender<String>,
    ) -> Result<GenerationResult> {
        let body = self.build_request(prompt, model, config, false, true);
        let response = self.post_completion(&body).await?;

        let mut stream = response.bytes_stream();
        let mut lines = SseLineBuffer::default();
        let mut text = String::new();
        let mut usage = None;
        let mut receiver_alive = true;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_send_error(&self.endpoint, e))?;
            for line in lines.push(&chunk) {
                match parse_sse_line(&line)? {
                    SseEvent::Done => break 'read,
                    SseEvent::Skip => {}
                    SseEvent::Data(event) => {
                        if let Some(reported) = extract_usage(&event) {
                            usage = Some(reported);
                        }
                        if let Some(delta) = event
                            .pointer("/choices/0/delta/content")
                            .and_then(Value::as_str)
                            .filter(|d| !d.is_empty())
                        {
                            text.push_str(delta);
                            if receiver_alive && chunks.send(delta.to_string()).await.is_err() {
                                warn!(backend = %self.kind, "Stream receiver dropped; collecting remaining text");
                                receiver_alive = false;
                            }
                        }
                    }
                }
            }
        }

        if let Some(rest) = lines.finish() {
            if let SseEvent::Data(event) = parse_sse_line(&rest)? {
                if let Some(delta) = event.pointer("/choices/0/delta/content").and_then(Value::as_str) {
                    text.push_str(delta);
                    if receiver_alive {
                        let _ = chunks.send(delta.to_string()).await;
                    }
                }
            }
        }

        Ok(GenerationResult::new(Payload::Text(text), self.kind, model).with_usage(usage))
    }
}

/// Splits a byte stream into complete lines, holding partial lines until
/// their terminator arrives
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Append bytes and return every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the stream ends without a final newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// One parsed server-sent-event line
#[derive(Debug, PartialEq)]
pub enum SseEvent {
    Data(Value),
    Done,
    Skip,
}

/// Interpret a single SSE line from a completion stream
pub fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let event: Value = serde_json::from_str(data)?;
    if let Some(error) = event.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("stream reported an error");
        return Err(AppError::Upstream {
            status: 200,
            message: http::truncate(message),
        });
    }
    Ok(SseEvent::Data(event))
}

/// Text of the first completion choice
pub fn extract_text(response: &Value) -> Option<String> {
    let content = response.pointer("/choices/0/message/content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let text: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join(""))
        }
        _ => None,
    }
}

fn refusal(response: &Value) -> Option<String> {
    let message = response.pointer("/choices/0/message")?;
    if let Some(refusal) = message.get("refusal").and_then(Value::as_str) {
        return Some(refusal.to_string());
    }
    let finish = response.pointer("/choices/0/finish_reason").and_then(Value::as_str);
    (finish == Some("content_filter")).then(|| "blocked by the provider's content filter".to_string())
}

fn extract_usage(response: &Value) -> Option<Usage> {
    response
        .get("usage")
        .filter(|u| u.is_object())
        .and_then(|u| serde_json::from_value(u.clone()).ok())
}

/// Find the best image reference in a completion: base64 payloads first,
/// then data URIs, then remote URLs
pub fn extract_image_ref(response: &Value) -> Option<ImageRef> {
    let mut found = Vec::new();

    if let Some(data) = response.get("data").and_then(Value::as_array) {
        for item in data {
            collect_image_value(item, &mut found);
        }
    }

    if let Some(message) = response.pointer("/choices/0/message") {
        if let Some(images) = message.get("images").and_then(Value::as_array) {
            for image in images {
                collect_image_value(image, &mut found);
            }
        }
        match message.get("content") {
            Some(Value::String(text)) => collect_from_text(text, &mut found),
            Some(Value::Array(parts)) => {
                for part in parts {
                    match part.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                collect_from_text(text, &mut found);
                            }
                        }
                        _ => collect_image_value(part, &mut found),
                    }
                }
            }
            _ => {}
        }
    }

    found.into_iter().min()
}

fn collect_image_value(value: &Value, found: &mut Vec<ImageRef>) {
    match value {
        Value::String(s) => classify_reference(s, found),
        Value::Object(_) => {
            if let Some(b64) = value.get("b64_json").and_then(Value::as_str) {
                found.push(ImageRef::Base64(b64.to_string()));
            }
            for pointer in ["/image_url/url", "/image_url", "/url"] {
                if let Some(s) = value.pointer(pointer).and_then(Value::as_str) {
                    classify_reference(s, found);
                }
            }
        }
        _ => {}
    }
}

fn classify_reference(reference: &str, found: &mut Vec<ImageRef>) {
    let reference = reference.trim();
    if base64::is_data_uri(reference) {
        found.push(ImageRef::DataUri(reference.to_string()));
    } else if reference.starts_with("http://") || reference.starts_with("https://") {
        found.push(ImageRef::Url(reference.to_string()));
    }
}

fn collect_from_text(text: &str, found: &mut Vec<ImageRef>) {
    if let Some(start) = text.find("data:image/") {
        let uri: String = text[start..]
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != ')' && *c != '"')
            .collect();
        classify_reference(&uri, found);
    }
    for scheme in ["https://", "http://"] {
        if let Some(start) = text.find(scheme) {
            let url: String = text[start..]
                .chars()
                .take_while(|c| !c.is_whitespace() && !matches!(c, ')' | '"' | '>' | ']'))
                .collect();
            classify_reference(&url, found);
        }
    }
}

/// Map a non-success completion response to an error category
fn map_error_response(status: reqwest::StatusCode, body: &str) -> AppError {
    let message = http::error_message(body);
    let lowered = body.to_lowercase();

    if lowered.contains("insufficient_quota") || lowered.contains("billing") {
        return AppError::ProviderMisconfigured(format!("account quota exhausted: {}", message));
    }
    if lowered.contains("content_policy") || lowered.contains("safety system") {
        return AppError::ContentRejected(message);
    }
    http::status_error(status, message)
}
