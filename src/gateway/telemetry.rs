//! Per-backend latency and outcome tracking

use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{Feature, ProviderKind};
use crate::error::AppError;

/// Consecutive failures before a backend is reported as degraded
const FAILURE_THRESHOLD: u32 = 3;

/// Running totals for one backend
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub total_latency_ms: u64,
    pub last_latency_ms: u64,
    pub last_error_class: Option<&'static str>,
}

impl BackendStats {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }

    pub fn degraded(&self) -> bool {
        self.consecutive_failures >= FAILURE_THRESHOLD
    }
}

/// Telemetry sink shared by the orchestrator and the status endpoint
#[derive(Default)]
pub struct Telemetry {
    stats: DashMap<ProviderKind, BackendStats>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one adapter call
    pub fn record(
        &self,
        backend: ProviderKind,
        feature: Feature,
        latency: Duration,
        error: Option<&AppError>,
    ) {
        let latency_ms = latency.as_millis() as u64;
        let error_class = error.map(AppError::class);

        info!(
            target: "gen_broker::telemetry",
            backend = %backend,
            feature = %feature,
            latency_ms = latency_ms,
            success = error.is_none(),
            error_class = error_class.unwrap_or(""),
            "Backend call finished"
        );

        let mut stats = self.stats.entry(backend).or_default();
        stats.requests += 1;
        stats.total_latency_ms += latency_ms;
        stats.last_latency_ms = latency_ms;

        match error_class {
            None => {
                if stats.degraded() {
                    info!(backend = %backend, "Backend recovered");
                }
                stats.successes += 1;
                stats.consecutive_failures = 0;
            }
            Some(class) => {
                stats.failures += 1;
                stats.consecutive_failures += 1;
                stats.last_error_class = Some(class);
                if stats.consecutive_failures == FAILURE_THRESHOLD {
                    warn!(
                        backend = %backend,
                        failures = stats.consecutive_failures,
                        error_class = class,
                        "Backend degraded after consecutive failures"
                    );
                }
            }
        }
    }

    pub fn get(&self, backend: ProviderKind) -> Option<BackendStats> {
        self.stats.get(&backend).map(|s| s.clone())
    }

    /// All backends that have been called, in a stable order
    pub fn snapshot(&self) -> Vec<(ProviderKind, BackendStats)> {
        let mut all: Vec<_> = self
            .stats
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        all.sort_by_key(|(kind, _)| *kind);
        all
    }
}
