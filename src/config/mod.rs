//! Configuration module - settings loaded from file and environment

pub mod settings;

pub use settings::{
    ApiKeyConfig, AuthConfig, FeatureConfig, LoggingConfig, OrchestratorConfig, ProviderConfig,
    SchedulerConfig, ServerConfig, Settings, WorkflowConfig, DEFAULT_CONFIG_PATH,
};
