//! Common error types for the generation broker

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::backend::ProviderKind;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimited { limit: u32, window_secs: u64 },

    #[error("Request queue is full ({0} waiting)")]
    QueueFull(usize),

    #[error("Request timed out after {0}ms")]
    RequestTimeout(u64),

    #[error("Request waited in queue for more than {0}ms")]
    QueueTimeout(u64),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Request {0} is already being processed and cannot be cancelled")]
    NotCancellable(String),

    #[error("No such request: {0}")]
    TaskNotFound(String),

    #[error("Request {0} belongs to another user")]
    Forbidden(String),

    #[error("No provider available for {0}")]
    ProviderUnavailable(String),

    #[error("Provider misconfigured: {0}")]
    ProviderMisconfigured(String),

    #[error("Workflow failed: {0}")]
    WorkflowError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upstream rate limit: {0}")]
    UpstreamRateLimited(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Content rejected: {0}")]
    ContentRejected(String),

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("{backend}: {source}")]
    Provider {
        backend: ProviderKind,
        #[source]
        source: Box<AppError>,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Attach the backend that produced this error
    pub fn with_backend(self, backend: ProviderKind) -> Self {
        match self {
            already @ AppError::Provider { .. } => already,
            other => AppError::Provider {
                backend,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error once backend context is peeled off
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Provider { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short, stable label used in telemetry records
    pub fn class(&self) -> &'static str {
        match self.root() {
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Json(_) => "json",
            AppError::HttpClient(_) => "http_client",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::QueueFull(_) => "queue_full",
            AppError::RequestTimeout(_) => "request_timeout",
            AppError::QueueTimeout(_) => "queue_timeout",
            AppError::Cancelled => "cancelled",
            AppError::NotCancellable(_) => "not_cancellable",
            AppError::TaskNotFound(_) => "task_not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::ProviderUnavailable(_) => "provider_unavailable",
            AppError::ProviderMisconfigured(_) => "provider_misconfigured",
            AppError::WorkflowError(_) => "workflow_error",
            AppError::Transport(_) => "transport",
            AppError::UpstreamRateLimited(_) => "upstream_rate_limited",
            AppError::UpstreamTimeout(_) => "upstream_timeout",
            AppError::ContentRejected(_) => "content_rejected",
            AppError::Upstream { .. } => "upstream",
            AppError::Provider { .. } => "provider",
            AppError::AuthenticationFailed(_) => "authentication_failed",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Error response format (OpenAI compatible)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = match self.root() {
            AppError::Config(_) | AppError::Io(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
            }
            AppError::Json(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", Some("invalid_json")),
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", None),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", Some("rate_limit_exceeded")),
            AppError::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "server_error", Some("queue_full")),
            AppError::RequestTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error", Some("request_timeout")),
            AppError::QueueTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error", Some("queue_timeout")),
            AppError::Cancelled => (StatusCode::CONFLICT, "cancelled", Some("cancelled")),
            AppError::NotCancellable(_) => (StatusCode::CONFLICT, "invalid_request_error", Some("not_cancellable")),
            AppError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "not_found_error", Some("task_not_found")),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "permission_error", Some("forbidden")),
            AppError::ProviderUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "server_error", Some("provider_unavailable")),
            AppError::ProviderMisconfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, "server_error", Some("provider_misconfigured")),
            AppError::ContentRejected(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_request_error", Some("content_rejected")),
            AppError::AuthenticationFailed(_) => (StatusCode::UNAUTHORIZED, "authentication_error", Some("invalid_api_key")),
            AppError::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error", Some("upstream_timeout")),
            AppError::HttpClient(_)
            | AppError::WorkflowError(_)
            | AppError::Transport(_)
            | AppError::UpstreamRateLimited(_)
            | AppError::Upstream { .. }
            | AppError::Provider { .. } => (StatusCode::BAD_GATEWAY, "backend_error", None),
        };

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: error_type.to_string(),
                code: code.map(|c| c.to_string()),
            },
        });

        (status, body).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;
