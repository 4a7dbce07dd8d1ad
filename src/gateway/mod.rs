//! Gateway module - orchestration across backends and call telemetry

pub mod orchestrator;
pub mod telemetry;

pub use orchestrator::{FallbackPolicy, GenerationRequest, Orchestrator};
pub use telemetry::{BackendStats, Telemetry};
