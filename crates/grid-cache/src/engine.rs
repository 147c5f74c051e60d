//! Trajectory interpolation engine.
//!
//! Ties the pieces together for one request: sync the hours the trajectory
//! spans, crop the local store around it, then interpolate every cached
//! field at each point.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::aero;
use crate::config::CacheConfig;
use crate::error::{GridCacheError, Result};
use crate::interpolation::{FieldColumns, Interpolator};
use crate::remote::RemoteGridSource;
use crate::sync::{SyncEngine, SyncReport};
use crate::trajectory::{normalize_longitude, TrajectoryTable};
use crate::types::{hourly_range, BoundingBox, GridCoordinate};

/// Interpolates cached grid fields along trajectories.
#[derive(Clone)]
pub struct TrajectoryEngine {
    sync: SyncEngine,
}

impl TrajectoryEngine {
    /// Create an engine for one local store and its remote source.
    pub fn new(config: CacheConfig, remote: Arc<dyn RemoteGridSource>) -> Self {
        Self {
            sync: SyncEngine::new(config, remote),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        self.sync.config()
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    /// Return a copy of `table` with one column per configured field.
    ///
    /// Points outside the cached grid get `null` values. When no hour of
    /// the trajectory's span is available at all, the table comes back
    /// unchanged.
    #[instrument(skip_all, fields(rows = table.len()))]
    pub async fn interpolate(&self, table: &TrajectoryTable) -> Result<TrajectoryTable> {
        let started = Instant::now();
        let points = table.flight_points()?;

        let (Some(start), Some(stop)) = (
            points.iter().map(|p| p.timestamp).min(),
            points.iter().map(|p| p.timestamp).max(),
        ) else {
            return Ok(table.clone());
        };

        let report = self.sync.sync(start, stop).await?;
        log_sync(&report);

        let config = self.config();
        let lons: Vec<f64> = points.iter().map(|p| normalize_longitude(p.longitude)).collect();
        let lats: Vec<f64> = points.iter().map(|p| p.latitude).collect();
        let window = BoundingBox::around(&lons, &lats)
            .ok_or_else(|| GridCacheError::invalid_trajectory("trajectory has no points"))?
            .expand(config.spatial_margin_deg);
        let hours = hourly_range(start, stop);

        let fields = config.fields.clone();
        let cube = self
            .sync
            .read_store(move |store| store.crop(&fields, &hours, &window))
            .await?;

        let cube = match cube {
            Some(cube) if !cube.times.is_empty() => cube,
            _ => {
                warn!(
                    start = %start,
                    stop = %stop,
                    "No cached data for the trajectory's time range, returning it unchanged"
                );
                return Ok(table.clone());
            }
        };

        debug!(
            shape = ?cube.shape(),
            min_lon = window.min_lon,
            max_lon = window.max_lon,
            min_lat = window.min_lat,
            max_lat = window.max_lat,
            "Cropped local store"
        );

        let altitudes: Vec<f64> = points.iter().map(|p| p.altitude).collect();
        let levels = aero::pressure_levels_hpa(&altitudes, config.altitude_unit);
        let coords: Vec<GridCoordinate> = points
            .iter()
            .zip(levels)
            .zip(lons)
            .map(|((point, level), longitude)| GridCoordinate {
                time: point.unix_seconds(),
                level,
                latitude: point.latitude,
                longitude,
            })
            .collect();

        let fields = config.fields.clone();
        let FieldColumns {
            columns,
            out_of_range,
        } = tokio::task::spawn_blocking(move || {
            Interpolator::new(&cube).interpolate_all(&fields, &coords)
        })
        .await?;

        metrics::counter!("grid_cache_points_interpolated_total").increment(points.len() as u64);
        metrics::counter!("grid_cache_points_out_of_range_total").increment(out_of_range as u64);
        metrics::histogram!("grid_cache_interpolation_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if out_of_range > 0 {
            warn!(
                out_of_range,
                rows = points.len(),
                "Some points fall outside the cached grid"
            );
        }
        info!(
            rows = points.len(),
            fields = columns.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Interpolated trajectory"
        );

        table.with_field_columns(columns)
    }
}

fn log_sync(report: &SyncReport) {
    if report.is_complete() {
        debug!(
            fetched = report.fetched.len(),
            present = report.already_present.len(),
            "Cache covers trajectory span"
        );
    } else {
        warn!(
            unavailable = ?report.unavailable,
            "Some hours of the trajectory span are unavailable remotely"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::SyntheticGridSource;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_empty_table_is_returned_unchanged() {
        let dir = TempDir::new().unwrap();
        let source = SyntheticGridSource::regional();
        let engine = TrajectoryEngine::new(
            source.cache_config(dir.path().join("cache.zarr")),
            Arc::new(source),
        );

        let table: TrajectoryTable = serde_json::from_value(json!({
            "timestamp": [],
            "latitude": [],
            "longitude": [],
            "altitude": []
        }))
        .unwrap();
        let out = engine.interpolate(&table).await.unwrap();
        assert_eq!(out, table);
    }

    #[tokio::test]
    async fn test_missing_column_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = SyntheticGridSource::regional();
        let engine = TrajectoryEngine::new(
            source.cache_config(dir.path().join("cache.zarr")),
            Arc::new(source),
        );

        let table: TrajectoryTable = serde_json::from_value(json!({
            "timestamp": ["2021-10-12T01:10:00"],
            "latitude": [40.3]
        }))
        .unwrap();
        let err = engine.interpolate(&table).await.unwrap_err();
        assert!(matches!(err, GridCacheError::InvalidTrajectory(_)));
    }
}
