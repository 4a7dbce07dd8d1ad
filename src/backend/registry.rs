//! Backend registry - per-backend configuration, adapters and selection
//!
//! The registry holds an immutable [`RegistrySnapshot`] that is swapped
//! wholesale on reload, so a request always sees one consistent view of
//! configuration for its whole lifetime.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::comfyui::ComfyUiBackend;
use crate::backend::openai::OpenAiBackend;
use crate::backend::stability::StabilityBackend;
use crate::backend::traits::{Feature, GenerationKind, ProviderAdapter, ProviderKind};
use crate::config::{FeatureConfig, ProviderConfig, Settings, WorkflowConfig};
use crate::error::{AppError, Result};

/// Preference order when any backend will do
const PRIMARY_ORDER: [ProviderKind; 4] = [
    ProviderKind::OpenAi,
    ProviderKind::Stability,
    ProviderKind::ComfyUi,
    ProviderKind::LocalAi,
];

const IMAGE_ORDER: [ProviderKind; 3] = [
    ProviderKind::Stability,
    ProviderKind::OpenAi,
    ProviderKind::ComfyUi,
];

/// Restricted content only goes to self-hosted backends
const RESTRICTED_IMAGE_ORDER: [ProviderKind; 2] = [ProviderKind::ComfyUi, ProviderKind::LocalAi];

const TEXT_ORDER: [ProviderKind; 2] = [ProviderKind::OpenAi, ProviderKind::LocalAi];

/// Priority list for a request family
pub fn priority_order(kind: GenerationKind, restricted: bool) -> &'static [ProviderKind] {
    match (kind, restricted) {
        (GenerationKind::Text, _) => &TEXT_ORDER,
        (GenerationKind::Image, true) => &RESTRICTED_IMAGE_ORDER,
        (GenerationKind::Image, false) => &IMAGE_ORDER,
    }
}

/// A configured backend and, when it qualifies, its adapter
#[derive(Clone)]
pub struct RegisteredProvider {
    pub kind: ProviderKind,
    pub config: ProviderConfig,
    adapter: Option<Arc<dyn ProviderAdapter>>,
}

impl RegisteredProvider {
    /// Enabled, has an endpoint, and has a credential unless self-hosted
    pub fn qualifies(&self) -> bool {
        let has_endpoint = self
            .config
            .endpoint
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        self.config.enabled
            && has_endpoint
            && (self.kind.is_self_hosted() || self.config.has_credentials())
    }
}

/// Point-in-time view of provider configuration
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    providers: HashMap<ProviderKind, RegisteredProvider>,
    features: HashMap<Feature, FeatureConfig>,
}

/// Build the adapter for a backend family
pub fn build_adapter(
    kind: ProviderKind,
    config: &ProviderConfig,
    workflow: &WorkflowConfig,
) -> Result<Arc<dyn ProviderAdapter>> {
    Ok(match kind {
        ProviderKind::OpenAi | ProviderKind::LocalAi => Arc::new(OpenAiBackend::new(kind, config)?),
        ProviderKind::Stability => Arc::new(StabilityBackend::new(config)?),
        ProviderKind::ComfyUi => Arc::new(ComfyUiBackend::new(config, workflow)?),
    })
}

impl RegistrySnapshot {
    /// Build adapters for every qualifying backend in the settings
    pub fn from_settings(settings: &Settings) -> Self {
        let mut snapshot = Self::configs_only(settings);
        for provider in snapshot.providers.values_mut() {
            if !provider.qualifies() {
                continue;
            }
            match build_adapter(provider.kind, &provider.config, &settings.workflow) {
                Ok(adapter) => provider.adapter = Some(adapter),
                Err(e) => warn!(backend = %provider.kind, error = %e, "Failed to build adapter"),
            }
        }
        snapshot
    }

    /// Use the given adapters instead of building them from configuration
    pub fn with_adapters(settings: &Settings, adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let mut snapshot = Self::configs_only(settings);
        for adapter in adapters {
            if let Some(provider) = snapshot.providers.get_mut(&adapter.kind()) {
                provider.adapter = Some(adapter);
            }
        }
        snapshot
    }

    fn configs_only(settings: &Settings) -> Self {
        let providers = settings
            .providers
            .iter()
            .map(|(kind, config)| {
                (
                    *kind,
                    RegisteredProvider {
                        kind: *kind,
                        config: config.clone(),
                        adapter: None,
                    },
                )
            })
            .collect();

        Self {
            providers,
            features: settings.features.clone(),
        }
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&RegisteredProvider> {
        self.providers.get(&kind)
    }

    /// Whether a backend qualifies and has a usable adapter
    pub fn is_available(&self, kind: ProviderKind) -> bool {
        self.providers
            .get(&kind)
            .is_some_and(|p| p.qualifies() && p.adapter.is_some())
    }

    pub fn adapter(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers
            .get(&kind)
            .filter(|p| p.qualifies())
            .and_then(|p| p.adapter.clone())
    }

    /// First available backend in the general preference order
    pub fn primary_backend(&self) -> Option<ProviderKind> {
        PRIMARY_ORDER.into_iter().find(|kind| self.is_available(*kind))
    }

    pub fn image_backend(&self, restricted: bool) -> Option<ProviderKind> {
        self.candidates(GenerationKind::Image, restricted).into_iter().next()
    }

    pub fn text_backend(&self) -> Option<ProviderKind> {
        self.candidates(GenerationKind::Text, false).into_iter().next()
    }

    /// Available backends for a request family, best first. A feature mapped
    /// to a backend of the family's list moves that backend to the front.
    pub fn candidates(&self, kind: GenerationKind, restricted: bool) -> Vec<ProviderKind> {
        let order = priority_order(kind, restricted);
        let feature = kind.feature(restricted);

        let mapped = self
            .features
            .get(&feature)
            .map(|f| f.backend)
            .filter(|backend| order.contains(backend));

        mapped
            .into_iter()
            .chain(order.iter().copied().filter(|k| Some(*k) != mapped))
            .filter(|k| self.is_available(*k))
            .collect()
    }

    /// Model for a backend and feature. There is no built-in default: an
    /// unmapped pair is a configuration error.
    pub fn resolve_model(&self, backend: ProviderKind, feature: Feature) -> Result<String> {
        if let Some(mapping) = self.features.get(&feature) {
            if mapping.backend == backend && !mapping.model.trim().is_empty() {
                return Ok(mapping.model.clone());
            }
        }

        self.providers
            .get(&backend)
            .and_then(|p| p.config.models.get(&feature))
            .filter(|m| !m.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                AppError::ProviderMisconfigured(format!(
                    "no model configured for feature '{}' on {}",
                    feature, backend
                ))
            })
    }

    pub fn status(&self) -> Vec<ProviderStatus> {
        ProviderKind::ALL
            .into_iter()
            .map(|kind| match self.providers.get(&kind) {
                Some(provider) => ProviderStatus {
                    backend: kind,
                    enabled: provider.config.enabled,
                    has_endpoint: provider.config.endpoint.is_some(),
                    has_credentials: provider.config.has_credentials(),
                    available: self.is_available(kind),
                    models: provider.config.models.clone(),
                },
                None => ProviderStatus {
                    backend: kind,
                    enabled: false,
                    has_endpoint: false,
                    has_credentials: false,
                    available: false,
                    models: HashMap::new(),
                },
            })
            .collect()
    }
}

/// Availability report for one backend
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub backend: ProviderKind,
    pub enabled: bool,
    pub has_endpoint: bool,
    pub has_credentials: bool,
    pub available: bool,
    pub models: HashMap<Feature, String>,
}

/// Shared handle over the current snapshot
pub struct BackendRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl BackendRegistry {
    pub fn new(settings: &Settings) -> Self {
        Self::from_snapshot(RegistrySnapshot::from_settings(settings))
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            refresh_task: Mutex::new(None),
        }
    }

    /// The current snapshot; callers keep it for the whole request
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    /// Rebuild from new settings and swap it in
    pub fn reload(&self, settings: &Settings) {
        self.replace(RegistrySnapshot::from_settings(settings));
    }

    pub fn replace(&self, snapshot: RegistrySnapshot) {
        let available: Vec<&str> = ProviderKind::ALL
            .iter()
            .filter(|k| snapshot.is_available(**k))
            .map(|k| k.as_str())
            .collect();
        info!(available = ?available, "Backend registry updated");
        *self.snapshot.write() = Arc::new(snapshot);
    }

    pub fn status(&self) -> Vec<ProviderStatus> {
        self.snapshot().status()
    }

    /// Periodically reload configuration from `path`. A file that fails to
    /// load or validate leaves the current snapshot in place.
    pub fn start_refresh(self: &Arc<Self>, interval: Duration, path: PathBuf) {
        let registry: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                match Settings::load_from_path(&path) {
                    Ok(settings) => registry.reload(&settings),
                    Err(e) => warn!(path = %path.display(), error = %e, "Keeping previous backend configuration"),
                }
                debug!(path = %path.display(), "Backend configuration refresh completed");
            }
        });

        if let Some(previous) = self.refresh_task.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Started backend configuration refresh");
    }

    pub fn stop_refresh(&self) {
        if let Some(handle) = self.refresh_task.lock().take() {
            handle.abort();
            info!("Stopped backend configuration refresh");
        }
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_task.get_mut().take() {
            handle.abort();
        }
    }
}
