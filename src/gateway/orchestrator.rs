//! Orchestrator - backend selection, model resolution and adapter dispatch

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::registry::{BackendRegistry, RegistrySnapshot};
use crate::backend::{
    GenerationConfig, GenerationKind, GenerationResult, ProgressSender, ProviderKind,
};
use crate::error::{AppError, Result};
use crate::gateway::telemetry::Telemetry;

/// What to do when the selected backend fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Use only the selected backend
    #[default]
    Disabled,
    /// Try the remaining qualifying backends in priority order
    Ordered,
}

/// One generation, as the orchestrator sees it
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub prompt: String,
    pub config: GenerationConfig,
    /// Skip selection and use this backend
    pub backend: Option<ProviderKind>,
    pub progress: Option<ProgressSender>,
}

impl GenerationRequest {
    pub fn image(prompt: impl Into<String>) -> Self {
        Self::new(GenerationKind::Image, prompt)
    }

    pub fn text(prompt: impl Into<String>) -> Self {
        Self::new(GenerationKind::Text, prompt)
    }

    pub fn new(kind: GenerationKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            config: GenerationConfig::default(),
            backend: None,
            progress: None,
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_backend(mut self, backend: ProviderKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }
}

fn family(kind: GenerationKind, restricted: bool) -> &'static str {
    match (kind, restricted) {
        (GenerationKind::Text, _) => "text generation",
        (GenerationKind::Image, true) => "restricted image generation",
        (GenerationKind::Image, false) => "image generation",
    }
}

/// Routes generation requests to adapters
pub struct Orchestrator {
    registry: Arc<BackendRegistry>,
    telemetry: Arc<Telemetry>,
    policy: FallbackPolicy,
}

impl Orchestrator {
    pub fn new(registry: Arc<BackendRegistry>, telemetry: Arc<Telemetry>, policy: FallbackPolicy) -> Self {
        Self {
            registry,
            telemetry,
            policy,
        }
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Generate with the selected backend, falling back only when the
    /// policy allows it
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        validate(request)?;
        let snapshot = self.registry.snapshot();
        let candidates = self.select(&snapshot, request)?;

        let mut last_error = None;
        for backend in candidates {
            match self.dispatch(&snapshot, backend, request).await {
                Ok(result) => return Ok(result),
                Err(e) if self.policy == FallbackPolicy::Ordered => {
                    warn!(backend = %backend, error = %e, "Backend failed, trying next candidate");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::ProviderUnavailable(family(request.kind, request.config.restricted).to_string())
        }))
    }

    /// Stream a text generation from the first selected backend. Chunks may
    /// already have reached the caller when a failure happens, so there is
    /// no fallback here.
    pub async fn generate_text_streaming(
        &self,
        request: &GenerationRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<GenerationResult> {
        if request.kind != GenerationKind::Text {
            return Err(AppError::InvalidRequest("only text generations can be streamed".to_string()));
        }
        validate(request)?;

        let snapshot = self.registry.snapshot();
        let backend = self
            .select(&snapshot, request)?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::ProviderUnavailable(family(request.kind, false).to_string()))?;

        let feature = request.kind.feature(false);
        let started = Instant::now();
        let outcome = async {
            let model = snapshot.resolve_model(backend, feature)?;
            let adapter = snapshot
                .adapter(backend)
                .ok_or_else(|| AppError::ProviderUnavailable(backend.to_string()))?;
            debug!(backend = %backend, model = %model, "Streaming text generation");
            adapter
                .generate_text_streaming(&request.prompt, &model, &request.config, chunks)
                .await
        }
        .await;

        self.telemetry
            .record(backend, feature, started.elapsed(), outcome.as_ref().err());
        outcome.map_err(|e| e.with_backend(backend))
    }

    /// Backends to try, in order
    fn select(&self, snapshot: &RegistrySnapshot, request: &GenerationRequest) -> Result<Vec<ProviderKind>> {
        let restricted = request.config.restricted;

        if let Some(forced) = request.backend {
            if request.kind == GenerationKind::Text && !forced.supports_text() {
                return Err(AppError::InvalidRequest(format!("{} does not generate text", forced)));
            }
            if !snapshot.is_available(forced) {
                return Err(AppError::ProviderUnavailable(format!("{} is not available", forced)));
            }
            return Ok(vec![forced]);
        }

        let mut candidates = snapshot.candidates(request.kind, restricted);
        if candidates.is_empty() {
            return Err(AppError::ProviderUnavailable(family(request.kind, restricted).to_string()));
        }
        if self.policy == FallbackPolicy::Disabled {
            candidates.truncate(1);
        }
        Ok(candidates)
    }

    async fn dispatch(
        &self,
        snapshot: &RegistrySnapshot,
        backend: ProviderKind,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        let feature = request.kind.feature(request.config.restricted);
        let started = Instant::now();

        let outcome = async {
            let model = snapshot.resolve_model(backend, feature)?;
            let adapter = snapshot
                .adapter(backend)
                .ok_or_else(|| AppError::ProviderUnavailable(backend.to_string()))?;

            debug!(backend = %backend, model = %model, kind = ?request.kind, "Dispatching generation");
            match request.kind {
                GenerationKind::Image => {
                    adapter
                        .generate_image(&request.prompt, &model, &request.config, request.progress.as_ref())
                        .await
                }
                GenerationKind::Text => {
                    adapter.generate_text(&request.prompt, &model, &request.config).await
                }
            }
        }
        .await;

        self.telemetry
            .record(backend, feature, started.elapsed(), outcome.as_ref().err());
        outcome.map_err(|e| e.with_backend(backend))
    }
}

fn validate(request: &GenerationRequest) -> Result<()> {
    if request.prompt.trim().is_empty() {
        return Err(AppError::InvalidRequest("prompt must not be empty".to_string()));
    }
    Ok(())
}
