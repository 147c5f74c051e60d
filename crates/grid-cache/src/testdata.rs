//! Synthetic grid data for tests and local experiments.
//!
//! [`SyntheticGridSource`] serves fields that are linear in all four
//! coordinates, so multilinear interpolation reproduces them exactly and
//! tests can compare against a closed form.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use zarrs::array::{ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs_filesystem::FilesystemStore;

use crate::config::{CacheConfig, ZarrCompression, DEFAULT_FIELDS};
use crate::error::{GridCacheError, Result};
use crate::remote::RemoteGridSource;
use crate::types::HourlyGrid;

/// 2021-10-12T00:00:00Z, origin of the synthetic time trend.
const EPOCH_2021_10_12: i64 = 1_633_996_800;

/// 1900-01-01T00:00:00Z, the CF reference used by [`write_remote_zarr`].
const EPOCH_1900: i64 = -2_208_988_800;

/// In-memory remote source with analytic fields.
///
/// Every field is `200 + 10 * field_index + 0.5 * hours + 0.1 * level +
/// 0.2 * latitude + 0.3 * longitude`, with `hours` counted from
/// 2021-10-12T00:00Z.
pub struct SyntheticGridSource {
    fields: Vec<String>,
    levels: Vec<f64>,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
    missing: BTreeSet<i64>,
    transient_failures: AtomicUsize,
    requests: Mutex<Vec<DateTime<Utc>>>,
}

impl SyntheticGridSource {
    pub fn new(
        fields: Vec<String>,
        levels: Vec<f64>,
        latitudes: Vec<f64>,
        longitudes: Vec<f64>,
    ) -> Self {
        Self {
            fields,
            levels,
            latitudes,
            longitudes,
            missing: BTreeSet::new(),
            transient_failures: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Quarter-degree grid over the western Mediterranean, latitudes
    /// descending like ERA5, with the default fields.
    pub fn regional() -> Self {
        Self::new(
            DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            vec![200.0, 250.0, 300.0, 400.0, 500.0],
            axis(50.0, -0.25, 61),
            axis(0.0, 0.25, 61),
        )
    }

    /// Coarse global grid (30 degree steps) for longitude wrap tests.
    pub fn global() -> Self {
        Self::new(
            vec!["temperature".to_string()],
            vec![300.0, 400.0],
            axis(90.0, -30.0, 7),
            axis(0.0, 30.0, 12),
        )
    }

    /// Report no data for this hour.
    pub fn with_missing(mut self, hour: DateTime<Utc>) -> Self {
        self.missing.insert(hour.timestamp());
        self
    }

    /// Fail the next `count` requests with a retryable error.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Hours requested so far, in call order.
    pub fn requested_hours(&self) -> Vec<DateTime<Utc>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn levels(&self) -> &[f64] {
        &self.levels
    }

    /// A cache configuration matching this source's fields and levels.
    pub fn cache_config(&self, local_store: impl Into<PathBuf>) -> CacheConfig {
        let mut config = CacheConfig::with_local_store(local_store);
        config.fields = self.fields.clone();
        config.levels = self.levels.clone();
        config.chunk_size = 32;
        config.compression = ZarrCompression::BloscLz4;
        config.initial_retry_delay_ms = 10;
        config.max_retry_delay_ms = 50;
        config
    }

    /// Closed-form value of a field at a coordinate.
    pub fn expected(
        &self,
        field: &str,
        time: DateTime<Utc>,
        level: f64,
        latitude: f64,
        longitude: f64,
    ) -> Option<f64> {
        let index = self.fields.iter().position(|f| f == field)?;
        let hours = (time.timestamp() - EPOCH_2021_10_12) as f64 / 3600.0
            + time.timestamp_subsec_millis() as f64 / 3_600_000.0;
        Some(
            200.0
                + 10.0 * index as f64
                + 0.5 * hours
                + 0.1 * level
                + 0.2 * latitude
                + 0.3 * longitude,
        )
    }

    /// Build the grid for one hour, or `None` if it is marked missing.
    pub fn grid(
        &self,
        hour: DateTime<Utc>,
        fields: &[String],
        levels: &[f64],
    ) -> Result<Option<HourlyGrid>> {
        if self.missing.contains(&hour.timestamp()) {
            return Ok(None);
        }

        for level in levels {
            if !self.levels.iter().any(|l| (l - level).abs() < 1e-6) {
                return Err(GridCacheError::remote_request(format!(
                    "level {} hPa not present remotely",
                    level
                )));
            }
        }

        let mut grid = HourlyGrid {
            time: hour,
            levels: levels.to_vec(),
            latitudes: self.latitudes.clone(),
            longitudes: self.longitudes.clone(),
            fields: Default::default(),
        };

        for field in fields {
            let mut values = Vec::with_capacity(grid.field_len());
            for &level in levels {
                for &lat in &self.latitudes {
                    for &lon in &self.longitudes {
                        let value = self.expected(field, hour, level, lat, lon).ok_or_else(|| {
                            GridCacheError::remote_request(format!(
                                "field {} not present remotely",
                                field
                            ))
                        })?;
                        values.push(value as f32);
                    }
                }
            }
            grid.fields.insert(field.clone(), values);
        }

        Ok(Some(grid))
    }
}

#[async_trait]
impl RemoteGridSource for SyntheticGridSource {
    async fn select_hour(
        &self,
        hour: DateTime<Utc>,
        fields: &[String],
        levels: &[f64],
    ) -> Result<Option<HourlyGrid>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(hour);
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GridCacheError::remote_unavailable("synthetic transient failure"));
        }

        self.grid(hour, fields, levels)
    }

    fn describe(&self) -> String {
        "synthetic".to_string()
    }
}

/// Write a CF-style Zarr hierarchy holding `count` consecutive hours of the
/// source starting at `first`, readable by
/// [`ZarrRemoteSource`](crate::remote::ZarrRemoteSource).
///
/// Time is stored as int64 `hours since 1900-01-01`.
pub fn write_remote_zarr(
    path: &Path,
    source: &SyntheticGridSource,
    first: DateTime<Utc>,
    count: usize,
) -> Result<()> {
    std::fs::create_dir_all(path)?;
    let storage = Arc::new(
        FilesystemStore::new(path).map_err(|e| GridCacheError::storage_error(e.to_string()))?,
    );

    GroupBuilder::new()
        .build(storage.clone(), "/")
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?
        .store_metadata()
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

    let first_hours = (first.timestamp() - EPOCH_1900) / 3600;
    let times: Vec<i64> = (0..count as i64).map(|i| first_hours + i).collect();
    write_1d(
        &storage,
        "time",
        DataType::Int64,
        FillValue::from(0i64),
        &times,
        Some("hours since 1900-01-01"),
    )?;
    for (name, values) in [
        ("level", &source.levels),
        ("latitude", &source.latitudes),
        ("longitude", &source.longitudes),
    ] {
        write_1d(
            &storage,
            name,
            DataType::Float64,
            FillValue::from(f64::NAN),
            values,
            None,
        )?;
    }

    let (nl, ny, nx) = (
        source.levels.len() as u64,
        source.latitudes.len() as u64,
        source.longitudes.len() as u64,
    );
    for field in &source.fields {
        let chunk_grid: zarrs::array::ChunkGrid = vec![1, nl.max(1), ny.max(1), nx.max(1)]
            .try_into()
            .map_err(|e| GridCacheError::invalid_config(format!("{:?}", e)))?;
        let array = ArrayBuilder::new(
            vec![count as u64, nl, ny, nx],
            DataType::Float32,
            chunk_grid,
            FillValue::from(f32::NAN),
        )
        .build(storage.clone(), &format!("/{}", field))
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        array
            .store_metadata()
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

        for i in 0..count {
            let hour = first + chrono::Duration::hours(i as i64);
            let Some(grid) = source.grid(hour, std::slice::from_ref(field), &source.levels)? else {
                continue;
            };
            let subset = ArraySubset::new_with_start_shape(
                vec![i as u64, 0, 0, 0],
                vec![1, nl, ny, nx],
            )
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
            array
                .store_array_subset_elements::<f32>(&subset, &grid.fields[field])
                .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        }
    }

    Ok(())
}

fn write_1d<T: zarrs::array::Element>(
    storage: &Arc<FilesystemStore>,
    name: &str,
    data_type: DataType,
    fill_value: FillValue,
    values: &[T],
    units: Option<&str>,
) -> Result<()> {
    let chunk_grid: zarrs::array::ChunkGrid = vec![values.len().max(1) as u64]
        .try_into()
        .map_err(|e| GridCacheError::invalid_config(format!("{:?}", e)))?;

    let mut attrs = serde_json::Map::new();
    if let Some(units) = units {
        attrs.insert("units".to_string(), serde_json::json!(units));
    }

    let mut binding =
        ArrayBuilder::new(vec![values.len() as u64], data_type, chunk_grid, fill_value);
    let builder = binding.attributes(attrs);
    let array = builder
        .build(storage.clone(), &format!("/{}", name))
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
    array
        .store_metadata()
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

    if !values.is_empty() {
        let subset = ArraySubset::new_with_start_shape(vec![0], vec![values.len() as u64])
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        array
            .store_array_subset_elements::<T>(&subset, values)
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
    }
    Ok(())
}

fn axis(start: f64, step: f64, len: usize) -> Vec<f64> {
    (0..len).map(|i| start + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_synthetic_source() {
        let source = SyntheticGridSource::regional().with_transient_failures(1);
        let hour = Utc.with_ymd_and_hms(2021, 10, 12, 2, 0, 0).unwrap();
        let fields = vec!["temperature".to_string()];

        assert!(source.select_hour(hour, &fields, &[300.0]).await.is_err());
        let grid = source
            .select_hour(hour, &fields, &[300.0])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(grid.levels, vec![300.0]);
        assert_eq!(grid.latitudes[0], 50.0);
        let first = grid.fields["temperature"][0] as f64;
        let expected = source.expected("temperature", hour, 300.0, 50.0, 0.0).unwrap();
        assert!((first - expected).abs() < 1e-3);
        assert_eq!(source.requested_hours().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_level_is_request_error() {
        let source = SyntheticGridSource::regional();
        let hour = Utc.with_ymd_and_hms(2021, 10, 12, 2, 0, 0).unwrap();
        let err = source
            .select_hour(hour, &["temperature".to_string()], &[925.0])
            .await
            .unwrap_err();
        assert!(matches!(err, GridCacheError::RemoteRequest(_)));
        assert!(!err.is_retryable());
    }
}
