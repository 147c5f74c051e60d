//! Application state for the trajectory API.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use grid_cache::{CacheConfig, TrajectoryEngine, ZarrRemoteSource};
use metrics_exporter_prometheus::PrometheusHandle;

/// Shared application state.
pub struct AppState {
    /// The configured engine every request goes through.
    pub engine: TrajectoryEngine,

    /// Renders `/metrics`; `None` when no recorder is installed.
    pub prometheus: Option<PrometheusHandle>,

    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: TrajectoryEngine, prometheus: Option<PrometheusHandle>) -> Self {
        Self {
            engine,
            prometheus,
            started_at: Utc::now(),
        }
    }

    /// Connect to the configured remote and build the engine.
    pub async fn from_config(
        config: CacheConfig,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let remote = ZarrRemoteSource::connect(&config.remote_url)
            .await
            .with_context(|| format!("failed to open remote dataset {}", config.remote_url))?;
        let engine = TrajectoryEngine::new(config, Arc::new(remote));

        Ok(Arc::new(Self::new(engine, prometheus)))
    }
}
