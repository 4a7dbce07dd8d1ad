//! Application settings and configuration management

use crate::backend::{Feature, ProviderKind};
use crate::error::{AppError, Result};
use crate::gateway::orchestrator::FallbackPolicy;
use crate::queue::Tier;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Configuration file read at startup and on refresh
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub providers: HashMap<ProviderKind, ProviderConfig>,
    #[serde(default)]
    pub features: HashMap<Feature, FeatureConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_keys: vec![],
        }
    }
}

/// One API key and the caller it identifies
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub owner: String,
    #[serde(default)]
    pub tier: Tier,
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Admission control, queueing and retry tunables
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Hard ceiling on simultaneously dispatched tasks
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum number of tasks waiting in the queue
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Overall deadline per task, measured from enqueue
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Deadline for a task to leave the queue, measured from enqueue
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
    /// Maximum executions per task, counting the first one
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Requests a free-tier user may make per window
    #[serde(default = "default_user_rate_limit")]
    pub user_rate_limit: u32,
    #[serde(default = "default_user_rate_window")]
    pub user_rate_window_ms: u64,
    #[serde(default = "default_tier_multipliers")]
    pub tier_multipliers: HashMap<Tier, f64>,
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
    #[serde(default = "default_initial_status_delay")]
    pub initial_status_delay_ms: u64,
    /// Seed for the moving average used in ETA estimates
    #[serde(default = "default_avg_task_secs")]
    pub avg_task_secs: f64,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_queue_size() -> usize {
    100
}

fn default_request_timeout() -> u64 {
    600_000
}

fn default_queue_timeout() -> u64 {
    300_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2_000
}

fn default_user_rate_limit() -> u32 {
    10
}

fn default_user_rate_window() -> u64 {
    60_000
}

fn default_tier_multipliers() -> HashMap<Tier, f64> {
    HashMap::from([(Tier::Free, 1.0), (Tier::Supporter, 2.0), (Tier::Premium, 3.0)])
}

fn default_status_interval() -> u64 {
    5_000
}

fn default_initial_status_delay() -> u64 {
    250
}

fn default_avg_task_secs() -> f64 {
    30.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            request_timeout_ms: default_request_timeout(),
            queue_timeout_ms: default_queue_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
            user_rate_limit: default_user_rate_limit(),
            user_rate_window_ms: default_user_rate_window(),
            tier_multipliers: default_tier_multipliers(),
            status_interval_ms: default_status_interval(),
            initial_status_delay_ms: default_initial_status_delay(),
            avg_task_secs: default_avg_task_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.user_rate_window_ms)
    }

    /// Rate multiplier for a tier; tiers without an entry count as 1.0
    pub fn tier_multiplier(&self, tier: Tier) -> f64 {
        self.tier_multipliers.get(&tier).copied().unwrap_or(1.0)
    }
}

/// Orchestrator behaviour
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub fallback: FallbackPolicy,
    /// Reload provider configuration from disk this often; 0 disables it
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

/// Tunables for the asynchronous workflow backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Wait after a completion signal before fetching the run's outputs
    #[serde(default = "default_completion_grace")]
    pub completion_grace_ms: u64,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_upscale_factor")]
    pub upscale_factor: f64,
    #[serde(default = "default_refine_denoise")]
    pub refine_denoise: f64,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_scheduler_name")]
    pub scheduler: String,
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_completion_grace() -> u64 {
    1_500
}

fn default_run_timeout() -> u64 {
    540_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_upscale_factor() -> f64 {
    1.5
}

fn default_refine_denoise() -> f64 {
    0.35
}

fn default_sampler() -> String {
    "euler_ancestral".to_string()
}

fn default_scheduler_name() -> String {
    "normal".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            completion_grace_ms: default_completion_grace(),
            run_timeout_ms: default_run_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            upscale_factor: default_upscale_factor(),
            refine_denoise: default_refine_denoise(),
            sampler: default_sampler(),
            scheduler: default_scheduler_name(),
        }
    }
}

/// Per-backend configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Push channel address when it differs from the one derived from `endpoint`
    #[serde(default)]
    pub push_endpoint: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Model name per feature
    #[serde(default)]
    pub models: HashMap<Feature, String>,
}

fn default_timeout() -> u64 {
    120_000
}

impl ProviderConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// Feature to backend and model mapping
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureConfig {
    pub backend: ProviderKind,
    pub model: String,
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_str().ok_or_else(|| {
            AppError::Config(config::ConfigError::Message(
                "Configuration path is not valid UTF-8".to_string(),
            ))
        })?;

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("auth.enabled", true)?
            // Load from configuration file
            .add_source(File::with_name(path).required(false))
            // Override with environment variables (prefixed with GEN_BROKER__)
            .add_source(
                Environment::with_prefix("GEN_BROKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(invalid("Server port cannot be 0".to_string()));
        }

        if self.scheduler.max_concurrent == 0 {
            return Err(invalid("scheduler.max_concurrent must be at least 1".to_string()));
        }

        for (kind, provider) in &self.providers {
            if provider.enabled && provider.endpoint.as_deref().map_or(true, str::is_empty) {
                return Err(invalid(format!("Provider '{}' is enabled but has no endpoint", kind)));
            }
        }

        for (feature, mapping) in &self.features {
            if !kind_supports(mapping.backend, *feature) {
                return Err(invalid(format!(
                    "Feature '{}' cannot be served by provider '{}'",
                    feature, mapping.backend
                )));
            }
            if mapping.model.trim().is_empty() {
                return Err(invalid(format!("Feature '{}' has an empty model name", feature)));
            }
        }

        Ok(())
    }
}

fn kind_supports(kind: ProviderKind, feature: Feature) -> bool {
    match feature {
        Feature::Chat => kind.supports_text(),
        Feature::Image => true,
        // Restricted content never leaves self-hosted backends
        Feature::RestrictedImage => kind.is_self_hosted(),
    }
}

fn invalid(message: String) -> AppError {
    AppError::Config(config::ConfigError::Message(message))
}
