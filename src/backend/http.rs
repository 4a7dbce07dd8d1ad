//! HTTP plumbing shared by the REST adapters

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Longest upstream error text carried into an error message
const MAX_ERROR_TEXT: usize = 500;

/// Build a client with the backend's request timeout
pub fn build_client(timeout_ms: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Attach a bearer credential when one is configured
pub fn authorize(builder: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) if !key.is_empty() => builder.bearer_auth(key),
        _ => builder,
    }
}

/// Classify a failure to get any response at all
pub fn map_send_error(endpoint: &str, error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::UpstreamTimeout(format!("{} did not respond in time", endpoint))
    } else if error.is_connect() || error.is_request() {
        AppError::Transport(format!("Connection to {} failed: {}", endpoint, error))
    } else {
        AppError::HttpClient(error)
    }
}

/// Trim the base URL so paths can be appended with a leading slash
pub fn base_url(endpoint: &str) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Cap upstream text at a readable length
pub fn truncate(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_ERROR_TEXT {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_ERROR_TEXT).collect();
    format!("{}...", cut)
}

/// Pull the most useful message out of a JSON error body
pub fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return truncate(body);
    };

    let candidates = [
        value.pointer("/error/message"),
        value.get("error").filter(|e| e.is_string()),
        value.get("message"),
        value.get("detail"),
    ];
    let message = candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_str)
        .map(truncate)
        .unwrap_or_else(|| truncate(body));
    message
}

/// Default mapping of a non-success status to an error category
pub fn status_error(status: StatusCode, message: String) -> AppError {
    match status.as_u16() {
        401 | 403 => AppError::ProviderMisconfigured(format!("credentials were rejected: {}", message)),
        429 => AppError::UpstreamRateLimited(message),
        408 | 504 => AppError::UpstreamTimeout(message),
        code => AppError::Upstream { status: code, message },
    }
}
