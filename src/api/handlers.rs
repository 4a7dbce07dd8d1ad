//! Request handlers

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::api::types::{
    BackendTelemetry, CancelResponse, CreateGenerationRequest, GenerationResponse,
    GenerationStatusResponse, HealthResponse,
};
use crate::error::{AppError, Result};
use crate::gateway::GenerationRequest;
use crate::middleware::Caller;
use crate::queue::{scheduler::work, EnqueueOptions};
use crate::AppState;

/// Submit a generation and wait for its result
pub async fn create_generation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateGenerationRequest>,
) -> Result<Json<GenerationResponse>> {
    if body.prompt.trim().is_empty() {
        return Err(AppError::InvalidRequest("prompt must not be empty".to_string()));
    }

    let id = body
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let request = GenerationRequest {
        kind: body.kind,
        prompt: body.prompt,
        config: body.config,
        backend: body.backend,
        progress: None,
    };

    let orchestrator = state.orchestrator.clone();
    let task = work(move || {
        let orchestrator = orchestrator.clone();
        let request = request.clone();
        async move { orchestrator.generate(&request).await }
    });

    let mut options = EnqueueOptions::new(caller.owner.clone(), caller.tier);
    if let Some(priority) = body.priority {
        options = options.with_priority(priority.min(caller.tier.priority()));
    }

    info!(
        request_id = %id,
        owner = %caller.owner,
        tier = ?caller.tier,
        kind = ?body.kind,
        "Generation requested"
    );

    let result = state.scheduler.schedule(id.clone(), task, options).await?;
    Ok(Json(GenerationResponse::new(id, result)))
}

/// Queue position of a pending generation
pub async fn get_generation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<GenerationStatusResponse>> {
    let owner = state
        .scheduler
        .owner_of(&id)
        .ok_or_else(|| AppError::TaskNotFound(id.clone()))?;
    if owner != caller.owner {
        return Err(AppError::Forbidden(id));
    }

    let status = state
        .scheduler
        .status(&id)
        .ok_or_else(|| AppError::TaskNotFound(id.clone()))?;
    Ok(Json(GenerationStatusResponse { id, status }))
}

/// Cancel a generation that has not started
pub async fn cancel_generation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>> {
    state.scheduler.cancel(&id, &caller.owner)?;
    Ok(Json(CancelResponse { id, cancelled: true }))
}

/// Health check endpoint
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let telemetry = state
        .telemetry
        .snapshot()
        .into_iter()
        .map(|(backend, stats)| BackendTelemetry { backend, stats })
        .collect();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        scheduler: state.scheduler.stats(),
        providers: state.registry.status(),
        telemetry,
    })
}
