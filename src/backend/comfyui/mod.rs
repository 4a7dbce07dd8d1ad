//! Asynchronous node-graph workflow backend (ComfyUI-style queue API)
//!
//! A run is submitted to `POST /prompt` and its completion is detected on one
//! of two channels: the push socket opened before submission, or polling of
//! `GET /history/{id}` when the socket is unavailable or drops. A completion
//! signal on the push channel is always followed by one confirmatory history
//! fetch after a grace delay, since outputs may not be persisted yet.

mod errors;
mod events;
mod graph;
mod run;

pub use events::{parse_history, parse_push_message, HistoryState, PushEvent};
pub use graph::{build_two_pass_graph, GraphParams, SAVE_NODE};
pub use run::{OutputRef, RunSignal, RunStatus, Transition, WorkflowRun};

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::http::{self, authorize, map_send_error};
use crate::backend::traits::{
    report, GenerationConfig, GenerationResult, Payload, ProgressEvent, ProgressSender,
    ProviderAdapter, ProviderKind,
};
use crate::config::{ProviderConfig, WorkflowConfig};
use crate::error::{AppError, Result};
use crate::queue::should_retry;
use crate::response::base64;

type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Edge length used when the request gives only an aspect ratio
const DEFAULT_EDGE: u32 = 1024;
const DEFAULT_STEPS: u32 = 30;
const DEFAULT_GUIDANCE: f32 = 7.0;
const FILENAME_PREFIX: &str = "broker";
/// Consecutive failed history fetches that end polling
const MAX_POLL_ERRORS: u32 = 3;

/// How the push channel ended
#[derive(Debug)]
enum PushOutcome {
    Triggered,
    Failed(String),
    /// Closed or broke before any completion signal
    Lost,
    TimedOut,
}

/// Workflow engine client
pub struct ComfyUiBackend {
    client: Client,
    endpoint: String,
    push_endpoint: String,
    api_key: Option<String>,
    workflow: WorkflowConfig,
}

/// Derive the push socket address from the REST endpoint
pub fn push_url_for(endpoint: &str) -> String {
    let endpoint = http::base_url(endpoint);
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{}/ws", rest)
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{}/ws", rest)
    } else {
        format!("{}/ws", endpoint)
    }
}

/// Final output size for a request
fn target_size(config: &GenerationConfig) -> (u32, u32) {
    match (config.width, config.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            let scale = config.ratio().unwrap_or(1.0).sqrt();
            (
                graph::snap_to_latent(DEFAULT_EDGE as f64 * scale),
                graph::snap_to_latent(DEFAULT_EDGE as f64 / scale),
            )
        }
    }
}

impl ComfyUiBackend {
    /// Create a new backend from configuration
    pub fn new(config: &ProviderConfig, workflow: &WorkflowConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            AppError::ProviderMisconfigured("comfyui has no endpoint configured".to_string())
        })?;

        let push_endpoint = match config.push_endpoint.as_deref() {
            Some(push) if !push.is_empty() => http::base_url(push),
            _ => push_url_for(endpoint),
        };

        Ok(Self {
            client: http::build_client(config.timeout_ms)?,
            endpoint: http::base_url(endpoint),
            push_endpoint,
            api_key: config.api_key.clone(),
            workflow: workflow.clone(),
        })
    }

    fn graph_params(&self, prompt: &str, model: &str, config: &GenerationConfig) -> GraphParams {
        let (width, height) = target_size(config);
        let seed = config
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen::<u32>() as u64);

        GraphParams {
            checkpoint: model.to_string(),
            positive: prompt.to_string(),
            negative: config.negative_prompt.clone().unwrap_or_default(),
            width,
            height,
            steps: config.steps.unwrap_or(DEFAULT_STEPS),
            guidance: config.guidance_scale.unwrap_or(DEFAULT_GUIDANCE),
            sampler: config
                .sampler
                .clone()
                .unwrap_or_else(|| self.workflow.sampler.clone()),
            scheduler: self.workflow.scheduler.clone(),
            seed,
            upscale_factor: self.workflow.upscale_factor,
            refine_denoise: self.workflow.refine_denoise,
            filename_prefix: FILENAME_PREFIX.to_string(),
        }
    }

    /// Open the push socket; any failure means the run is polled instead
    async fn connect_push(&self, client_id: &str) -> Option<PushStream> {
        let url = format!("{}?clientId={}", self.push_endpoint, client_id);
        let mut request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                warn!(url = %url, error = %e, "Invalid push channel address");
                return None;
            }
        };
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", key)) {
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }

        let connect_timeout = Duration::from_millis(self.workflow.connect_timeout_ms);
        match timeout(connect_timeout, connect_async(request)).await {
            Ok(Ok((stream, _))) => Some(stream),
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "Push channel unavailable, polling instead");
                None
            }
            Err(_) => {
                warn!(url = %url, "Push channel connect timed out, polling instead");
                None
            }
        }
    }

    /// Queue the graph and return the run id
    async fn submit(&self, graph: &Value, client_id: &str) -> Result<String> {
        let url = format!("{}/prompt", self.endpoint);
        let response = authorize(self.client.post(&url), self.api_key.as_deref())
            .json(&json!({ "prompt": graph, "client_id": client_id }))
            .send()
            .await
            .map_err(|e| map_send_error(&self.endpoint, e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(match serde_json::from_str::<Value>(&body) {
                Ok(value) if status == StatusCode::BAD_REQUEST => {
                    AppError::WorkflowError(errors::describe_submission_error(&value))
                }
                _ => http::status_error(status, http::error_message(&body)),
            });
        }

        let value: Value = serde_json::from_str(&body)?;
        let has_node_errors = value
            .get("node_errors")
            .and_then(Value::as_object)
            .is_some_and(|errors| !errors.is_empty());
        if has_node_errors {
            return Err(AppError::WorkflowError(errors::describe_submission_error(&value)));
        }

        value
            .get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::WorkflowError("the server did not return a run id".to_string()))
    }

    async fn watch_push(
        &self,
        stream: &mut PushStream,
        run: &mut WorkflowRun,
        deadline: Instant,
        progress: Option<&ProgressSender>,
    ) -> PushOutcome {
        loop {
            let frame = match timeout_at(deadline, stream.next()).await {
                Err(_) => return PushOutcome::TimedOut,
                Ok(None) => return PushOutcome::Lost,
                Ok(Some(Err(e))) => {
                    debug!(run_id = %run.run_id(), error = %e, "Push channel error");
                    return PushOutcome::Lost;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => return PushOutcome::Lost,
                // Binary frames carry live previews
                _ => continue,
            };

            let Some(event) = parse_push_message(&text) else {
                continue;
            };
            if !event.concerns(run.run_id()) {
                continue;
            }

            match run.apply(event.signal) {
                Transition::Unchanged => {}
                Transition::Queued => report(progress, ProgressEvent::Queued),
                Transition::Progress(percent) => {
                    report(progress, ProgressEvent::Executing { percent })
                }
                Transition::CompletionTriggered => return PushOutcome::Triggered,
                Transition::Failed(message) => return PushOutcome::Failed(message),
            }
        }
    }

    async fn fetch_history(&self, run_id: &str) -> Result<HistoryState> {
        let url = format!("{}/history/{}", self.endpoint, run_id);
        let response = authorize(self.client.get(&url), self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| map_send_error(&self.endpoint, e))?;

        let status = response.status();
        // Not registered yet
        if status == StatusCode::NOT_FOUND {
            return Ok(HistoryState::Pending);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http::status_error(status, http::error_message(&body)));
        }

        let body: Value = response.json().await?;
        Ok(parse_history(run_id, &body))
    }

    /// Poll history until the run settles or the deadline passes
    async fn poll_for_output(&self, run: &mut WorkflowRun, deadline: Instant) -> Result<OutputRef> {
        let interval = Duration::from_millis(self.workflow.poll_interval_ms);
        let mut consecutive_errors = 0;

        loop {
            match self.fetch_history(run.run_id()).await {
                Ok(HistoryState::Completed(output)) => {
                    run.apply(RunSignal::Finished);
                    return output.or_else(|| run.output().cloned()).ok_or_else(|| {
                        AppError::WorkflowError("the workflow finished without saving an image".to_string())
                    });
                }
                Ok(HistoryState::Failed(message)) => {
                    run.apply(RunSignal::Failed(message.clone()));
                    return Err(AppError::WorkflowError(message));
                }
                Ok(HistoryState::Pending) => consecutive_errors = 0,
                Err(e) if should_retry(&e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_POLL_ERRORS {
                        return Err(e);
                    }
                    warn!(run_id = %run.run_id(), error = %e, attempt = consecutive_errors, "History fetch failed");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(run));
            }
            sleep_until((now + interval).min(deadline)).await;
        }
    }

    async fn await_output(
        &self,
        run: &mut WorkflowRun,
        push: Option<&mut PushStream>,
        deadline: Instant,
        progress: Option<&ProgressSender>,
    ) -> Result<OutputRef> {
        if let Some(stream) = push {
            match self.watch_push(stream, run, deadline, progress).await {
                PushOutcome::Triggered => {
                    debug!(run_id = %run.run_id(), "Completion signalled on push channel");
                    let grace = Duration::from_millis(self.workflow.completion_grace_ms);
                    sleep_until((Instant::now() + grace).min(deadline)).await;
                }
                PushOutcome::Failed(message) => return Err(AppError::WorkflowError(message)),
                PushOutcome::Lost => {
                    warn!(run_id = %run.run_id(), "Push channel closed before completion, polling instead");
                }
                PushOutcome::TimedOut => return Err(self.timed_out(run)),
            }
        }

        self.poll_for_output(run, deadline).await
    }

    fn timed_out(&self, run: &mut WorkflowRun) -> AppError {
        run.time_out();
        AppError::UpstreamTimeout(format!(
            "workflow run {} did not finish within {}s",
            run.run_id(),
            self.workflow.run_timeout_ms / 1000
        ))
    }

    /// Remove a run we stopped waiting for from the server's queue
    async fn abandon(&self, run_id: &str) {
        let url = format!("{}/queue", self.endpoint);
        let result = authorize(self.client.post(&url), self.api_key.as_deref())
            .json(&json!({ "delete": [run_id] }))
            .send()
            .await;
        if let Err(e) = result {
            debug!(run_id = %run_id, error = %e, "Failed to remove abandoned run");
        }
    }

    /// Download a produced image
    async fn fetch_output(&self, output: &OutputRef) -> Result<Vec<u8>> {
        let url = format!("{}/view", self.endpoint);
        let response = authorize(self.client.get(&url), self.api_key.as_deref())
            .query(&[
                ("filename", output.filename.as_str()),
                ("subfolder", output.subfolder.as_str()),
                ("type", output.kind.as_str()),
            ])
            .send()
            .await
            .map_err(|e| map_send_error(&self.endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http::status_error(status, http::error_message(&body)));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ProviderAdapter for ComfyUiBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ComfyUi
    }

    async fn generate_image(
        &self,
        prompt: &str,
        model: &str,
        config: &GenerationConfig,
        progress: Option<&ProgressSender>,
    ) -> Result<GenerationResult> {
        let params = self.graph_params(prompt, model, config);
        let graph = build_two_pass_graph(&params);
        let client_id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + Duration::from_millis(self.workflow.run_timeout_ms);

        let mut push = self.connect_push(&client_id).await;
        let run_id = self.submit(&graph, &client_id).await?;
        info!(
            backend = "comfyui",
            run_id = %run_id,
            model = %model,
            push = push.is_some(),
            "Workflow run submitted"
        );

        let mut run = WorkflowRun::new(run_id.clone());
        report(progress, ProgressEvent::Submitted { run_id: run_id.clone() });
        if run.apply(RunSignal::Queued) == Transition::Queued {
            report(progress, ProgressEvent::Queued);
        }

        let outcome = self.await_output(&mut run, push.as_mut(), deadline, progress).await;
        if let Some(mut stream) = push {
            let _ = stream.close(None).await;
        }

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                if run.status() == &RunStatus::TimedOut {
                    self.abandon(&run_id).await;
                }
                return Err(e);
            }
        };

        report(progress, ProgressEvent::Finalizing);
        let bytes = self.fetch_output(&output).await?;
        run.complete(output);

        let mime = base64::sniff_image_mime(&bytes).unwrap_or("image/png").to_string();
        debug!(run_id = %run_id, size = bytes.len(), "Workflow output fetched");

        Ok(GenerationResult::new(Payload::Image { bytes, mime }, ProviderKind::ComfyUi, model)
            .with_seed(Some(params.seed)))
    }
}
