//! Generation request broker
//!
//! Admits, orders and throttles image and text generation requests per user
//! and globally, then routes each one to a backend through a uniform adapter
//! contract covering synchronous JSON, multipart and asynchronous workflow
//! protocols.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod queue;
pub mod response;

pub use error::{AppError, Result};

use std::sync::Arc;

use backend::{BackendRegistry, GenerationResult};
use gateway::{Orchestrator, Telemetry};
use queue::RequestScheduler;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<config::Settings>,
    pub registry: Arc<BackendRegistry>,
    pub telemetry: Arc<Telemetry>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: RequestScheduler<GenerationResult>,
}

impl AppState {
    /// Build the full stack from settings; must be called inside a Tokio runtime
    pub fn new(settings: config::Settings) -> Self {
        let registry = Arc::new(BackendRegistry::new(&settings));
        Self::with_registry(settings, registry)
    }

    /// Build around an existing registry
    pub fn with_registry(settings: config::Settings, registry: Arc<BackendRegistry>) -> Self {
        let telemetry = Arc::new(Telemetry::new());
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            telemetry.clone(),
            settings.orchestrator.fallback,
        ));
        let scheduler = RequestScheduler::new(settings.scheduler.clone());

        Self {
            settings: Arc::new(settings),
            registry,
            telemetry,
            orchestrator,
            scheduler,
        }
    }
}
