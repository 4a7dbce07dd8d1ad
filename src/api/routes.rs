//! Route table

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::api::handlers;
use crate::middleware::AuthLayer;
use crate::AppState;

/// Slack on top of the scheduler's own deadline before the HTTP layer gives up
const HTTP_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

pub fn create_router(state: Arc<AppState>) -> Router {
    let auth = AuthLayer::new(&state.settings.auth);
    let timeout = state.settings.scheduler.request_timeout() + HTTP_TIMEOUT_SLACK;

    Router::new()
        .route("/v1/generations", post(handlers::create_generation))
        .route(
            "/v1/generations/:id",
            get(handlers::get_generation).delete(handlers::cancel_generation),
        )
        .route("/health", get(handlers::health))
        .layer(auth)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
