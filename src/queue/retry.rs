//! Classification of failures the scheduler may retry

use crate::error::AppError;

/// Message fragments that mark a failure as transient
const TRANSIENT_SIGNATURES: &[&str] = &[
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "network",
    "connection reset",
    "connection refused",
    "econnreset",
    "socket hang up",
    "temporarily",
    "temporary",
    "try again",
    "overloaded",
    "unavailable",
    "bad gateway",
    "internal server error",
    "gateway timeout",
    "status 500",
    "status 502",
    "status 503",
    "status 504",
];

/// Whether a failed task should be run again
pub fn should_retry(error: &AppError) -> bool {
    match error.root() {
        AppError::RateLimited { .. }
        | AppError::QueueFull(_)
        | AppError::RequestTimeout(_)
        | AppError::QueueTimeout(_)
        | AppError::Cancelled
        | AppError::NotCancellable(_)
        | AppError::TaskNotFound(_)
        | AppError::Forbidden(_)
        | AppError::ProviderUnavailable(_)
        | AppError::ProviderMisconfigured(_)
        | AppError::ContentRejected(_)
        | AppError::AuthenticationFailed(_)
        | AppError::InvalidRequest(_)
        | AppError::Config(_) => false,

        AppError::Transport(_) | AppError::UpstreamRateLimited(_) | AppError::UpstreamTimeout(_) => {
            true
        }

        AppError::HttpClient(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.is_request()
                || e.status().is_some_and(|s| s.as_u16() == 429 || s.is_server_error())
        }

        AppError::Upstream { status, .. } => *status == 429 || *status >= 500,

        other => matches_transient_signature(&other.to_string()),
    }
}

fn matches_transient_signature(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| message.contains(sig))
}
