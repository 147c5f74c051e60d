//! Remote grid source reading a CF-style Zarr hierarchy.
//!
//! The hierarchy holds 1D coordinate arrays `time`, `level`, `latitude`,
//! `longitude` and one 4D array per field shaped
//! `[time, level, latitude, longitude]`. Both Zarr V2 (ARCO-ERA5) and V3
//! layouts are readable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, warn};
use zarrs::array::{Array, DataType};
use zarrs::array_subset::ArraySubset;
use zarrs::storage::ReadableStorageTraits;

use crate::error::{GridCacheError, Result};
use crate::types::HourlyGrid;

use super::storage::{create_http_storage, HttpStorage};
use super::RemoteGridSource;

/// Tolerance when matching coordinate values.
const COORD_EPSILON: f64 = 1e-6;

/// CF time encoding, e.g. `hours since 1900-01-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfTimeUnits {
    /// Length of one unit in seconds.
    pub unit_seconds: i64,
    /// Epoch of the encoding.
    pub reference: DateTime<Utc>,
}

impl CfTimeUnits {
    /// Parse a `"<unit> since <datetime>"` attribute.
    pub fn parse(units: &str) -> Result<Self> {
        let lower = units.trim().to_lowercase();
        let (unit, reference) = lower.split_once(" since ").ok_or_else(|| {
            GridCacheError::remote_request(format!("unsupported time units: {}", units))
        })?;

        let unit_seconds = match unit.trim() {
            "seconds" | "second" | "secs" | "s" => 1,
            "minutes" | "minute" | "mins" | "min" => 60,
            "hours" | "hour" | "hrs" | "h" => 3_600,
            "days" | "day" | "d" => 86_400,
            other => {
                return Err(GridCacheError::remote_request(format!(
                    "unsupported time unit: {}",
                    other
                )))
            }
        };

        let reference = parse_reference(reference).ok_or_else(|| {
            GridCacheError::remote_request(format!("unparseable time reference: {}", units))
        })?;

        Ok(Self {
            unit_seconds,
            reference,
        })
    }

    /// Encode a timestamp as a value in these units.
    pub fn encode(&self, t: DateTime<Utc>) -> f64 {
        (t - self.reference).num_seconds() as f64 / self.unit_seconds as f64
    }
}

fn parse_reference(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim().trim_end_matches(" utc").trim_end_matches('z');

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dt%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Regular time axis of the remote dataset.
#[derive(Debug, Clone, Copy)]
struct TimeAxis {
    units: CfTimeUnits,
    first: f64,
    step: f64,
    len: u64,
}

impl TimeAxis {
    /// Index of an hour on the axis, if it falls on it.
    fn index_of(&self, hour: DateTime<Utc>) -> Option<u64> {
        if self.len == 0 {
            return None;
        }

        let offset = (self.units.encode(hour) - self.first) / self.step;
        let idx = offset.round();
        if (offset - idx).abs() > COORD_EPSILON || idx < 0.0 || idx >= self.len as f64 {
            return None;
        }
        Some(idx as u64)
    }
}

struct Inner<S> {
    storage: Arc<S>,
    url: String,
    time_axis: TimeAxis,
    levels: Vec<f64>,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
}

/// Remote Zarr dataset, opened once and shared across fetches.
///
/// Coordinate axes are read when the source is opened; each
/// [`select_hour`](RemoteGridSource::select_hour) call then reads only the
/// requested hour of each field.
pub struct ZarrRemoteSource<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ZarrRemoteSource<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ZarrRemoteSource<HttpStorage> {
    /// Connect to a remote Zarr hierarchy over HTTP(S).
    ///
    /// Must be called from a multi-threaded tokio runtime.
    pub async fn connect(url: &str) -> Result<Self> {
        let storage = create_http_storage(url)?;
        let url = url.to_string();
        tokio::task::spawn_blocking(move || Self::open(storage, &url)).await?
    }
}

impl<S: ReadableStorageTraits + Send + Sync + 'static> ZarrRemoteSource<S> {
    /// Open the hierarchy and read its coordinate axes.
    ///
    /// # Arguments
    /// * `storage` - Storage rooted at the hierarchy
    /// * `url` - Identifier used in logs
    pub fn open(storage: Arc<S>, url: &str) -> Result<Self> {
        let time = open_array(&storage, "/time")?;
        let units = time
            .attributes()
            .get("units")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GridCacheError::remote_request("time array has no units attribute"))?;
        let units = CfTimeUnits::parse(units)?;

        let len = time.shape().first().copied().unwrap_or(0);
        let head = read_coordinate_range(&time, 0, len.min(2))?;
        let first = head.first().copied().unwrap_or(0.0);
        let step = if head.len() == 2 { head[1] - head[0] } else { 1.0 };
        if step.is_nan() || step <= 0.0 {
            return Err(GridCacheError::remote_request(
                "remote time axis is not increasing",
            ));
        }

        let levels = read_coordinate(&open_array(&storage, "/level")?)?;
        let latitudes = read_coordinate(&open_array(&storage, "/latitude")?)?;
        let longitudes = read_coordinate(&open_array(&storage, "/longitude")?)?;

        debug!(
            url = %url,
            times = len,
            levels = levels.len(),
            latitudes = latitudes.len(),
            longitudes = longitudes.len(),
            "Opened remote grid"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                url: url.to_string(),
                time_axis: TimeAxis {
                    units,
                    first,
                    step,
                    len,
                },
                levels,
                latitudes,
                longitudes,
            }),
        })
    }

    /// Pressure levels present remotely.
    pub fn levels(&self) -> &[f64] {
        &self.inner.levels
    }

    /// Number of time steps present remotely.
    pub fn time_len(&self) -> u64 {
        self.inner.time_axis.len
    }
}

impl<S: ReadableStorageTraits + Send + Sync + 'static> Inner<S> {
    fn select_hour_sync(
        &self,
        hour: DateTime<Utc>,
        fields: &[String],
        levels: &[f64],
    ) -> Result<Option<HourlyGrid>> {
        let Some(t) = self.time_axis.index_of(hour) else {
            return Ok(None);
        };

        // Confirm the coordinate really is this hour before trusting the index.
        let time = open_array(&self.storage, "/time")?;
        let stored = read_coordinate_range(&time, t, 1)?;
        let expected = self.time_axis.units.encode(hour);
        if stored.first().map_or(true, |v| (v - expected).abs() > COORD_EPSILON) {
            warn!(hour = %hour, index = t, "Remote time coordinate does not match hour");
            return Ok(None);
        }

        // Level filtering happens here; the remote may not support it.
        let level_idx = levels
            .iter()
            .map(|&level| {
                self.levels
                    .iter()
                    .position(|&l| (l - level).abs() < COORD_EPSILON)
                    .ok_or_else(|| {
                        GridCacheError::remote_request(format!(
                            "level {} hPa not present remotely",
                            level
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let (Some(&lo), Some(&hi)) = (level_idx.iter().min(), level_idx.iter().max()) else {
            return Err(GridCacheError::remote_request("no levels requested"));
        };

        let ny = self.latitudes.len();
        let nx = self.longitudes.len();
        let plane = ny * nx;

        let mut grid = HourlyGrid {
            time: hour,
            levels: levels.to_vec(),
            latitudes: self.latitudes.clone(),
            longitudes: self.longitudes.clone(),
            fields: Default::default(),
        };

        for field in fields {
            let array = open_array(&self.storage, &format!("/{}", field)).map_err(|_| {
                GridCacheError::remote_request(format!("field {} not present remotely", field))
            })?;

            let shape = array.shape();
            if shape.len() != 4 || shape[2] as usize != ny || shape[3] as usize != nx {
                return Err(GridCacheError::remote_request(format!(
                    "field {} has shape {:?}, expected [time, {}, {}, {}]",
                    field,
                    shape,
                    self.levels.len(),
                    ny,
                    nx
                )));
            }

            // One contiguous read spanning every requested level.
            let subset = ArraySubset::new_with_start_shape(
                vec![t, lo as u64, 0, 0],
                vec![1, (hi - lo + 1) as u64, ny as u64, nx as u64],
            )
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

            let block = read_f32(&array, &subset)?;

            let mut values = Vec::with_capacity(level_idx.len() * plane);
            for &li in &level_idx {
                let start = (li - lo) * plane;
                values.extend_from_slice(&block[start..start + plane]);
            }
            grid.fields.insert(field.clone(), values);
        }

        Ok(Some(grid))
    }
}

#[async_trait]
impl<S: ReadableStorageTraits + Send + Sync + 'static> RemoteGridSource for ZarrRemoteSource<S> {
    async fn select_hour(
        &self,
        hour: DateTime<Utc>,
        fields: &[String],
        levels: &[f64],
    ) -> Result<Option<HourlyGrid>> {
        let inner = Arc::clone(&self.inner);
        let fields = fields.to_vec();
        let levels = levels.to_vec();

        tokio::task::spawn_blocking(move || inner.select_hour_sync(hour, &fields, &levels)).await?
    }

    fn describe(&self) -> String {
        self.inner.url.clone()
    }
}

fn open_array<S: ReadableStorageTraits + 'static>(storage: &Arc<S>, path: &str) -> Result<Array<S>> {
    Array::open(Arc::clone(storage), path).map_err(|e| {
        GridCacheError::remote_request(format!("failed to open remote array {}: {}", path, e))
    })
}

/// Read a whole 1D coordinate array as f64.
fn read_coordinate<S: ReadableStorageTraits + 'static>(array: &Array<S>) -> Result<Vec<f64>> {
    let len = array.shape().first().copied().unwrap_or(0);
    read_coordinate_range(array, 0, len)
}

/// Read `len` elements of a 1D coordinate array starting at `start`.
fn read_coordinate_range<S: ReadableStorageTraits + 'static>(
    array: &Array<S>,
    start: u64,
    len: u64,
) -> Result<Vec<f64>> {
    if len == 0 {
        return Ok(Vec::new());
    }

    let subset = ArraySubset::new_with_start_shape(vec![start], vec![len])
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

    let fetch_err = |e: zarrs::array::ArrayError| GridCacheError::remote_unavailable(e.to_string());

    let values = match array.data_type() {
        DataType::Float64 => array
            .retrieve_array_subset_elements::<f64>(&subset)
            .map_err(fetch_err)?,
        DataType::Float32 => array
            .retrieve_array_subset_elements::<f32>(&subset)
            .map_err(fetch_err)?
            .into_iter()
            .map(f64::from)
            .collect(),
        DataType::Int64 => array
            .retrieve_array_subset_elements::<i64>(&subset)
            .map_err(fetch_err)?
            .into_iter()
            .map(|v| v as f64)
            .collect(),
        DataType::Int32 => array
            .retrieve_array_subset_elements::<i32>(&subset)
            .map_err(fetch_err)?
            .into_iter()
            .map(f64::from)
            .collect(),
        other => {
            return Err(GridCacheError::remote_request(format!(
                "unsupported coordinate data type {:?}",
                other
            )))
        }
    };

    Ok(values)
}

/// Read a field subset as f32, narrowing f64 storage.
fn read_f32<S: ReadableStorageTraits + 'static>(
    array: &Array<S>,
    subset: &ArraySubset,
) -> Result<Vec<f32>> {
    let fetch_err = |e: zarrs::array::ArrayError| GridCacheError::remote_unavailable(e.to_string());

    match array.data_type() {
        DataType::Float32 => array
            .retrieve_array_subset_elements::<f32>(subset)
            .map_err(fetch_err),
        DataType::Float64 => Ok(array
            .retrieve_array_subset_elements::<f64>(subset)
            .map_err(fetch_err)?
            .into_iter()
            .map(|v| v as f32)
            .collect()),
        other => Err(GridCacheError::remote_request(format!(
            "unsupported field data type {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_cf_units() {
        let units = CfTimeUnits::parse("hours since 1900-01-01").unwrap();
        assert_eq!(units.unit_seconds, 3_600);
        assert_eq!(units.reference, Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap());

        let units = CfTimeUnits::parse("seconds since 1970-01-01 00:00:00").unwrap();
        assert_eq!(units.unit_seconds, 1);
        assert_eq!(units.reference.timestamp(), 0);

        let units = CfTimeUnits::parse("Days since 2000-01-01T12:00:00Z").unwrap();
        assert_eq!(units.unit_seconds, 86_400);
        assert_eq!(units.reference, Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap());

        assert!(CfTimeUnits::parse("fortnights since 1900-01-01").is_err());
        assert!(CfTimeUnits::parse("hours after 1900-01-01").is_err());
    }

    #[test]
    fn test_encode() {
        let units = CfTimeUnits::parse("hours since 1900-01-01").unwrap();
        let t = Utc.with_ymd_and_hms(1900, 1, 2, 6, 0, 0).unwrap();
        assert_eq!(units.encode(t), 30.0);
    }

    #[test]
    fn test_time_axis_index() {
        let units = CfTimeUnits::parse("hours since 1900-01-01").unwrap();
        let start = Utc.with_ymd_and_hms(2021, 10, 12, 0, 0, 0).unwrap();
        let axis = TimeAxis {
            units,
            first: units.encode(start),
            step: 1.0,
            len: 48,
        };

        assert_eq!(axis.index_of(start), Some(0));
        assert_eq!(
            axis.index_of(Utc.with_ymd_and_hms(2021, 10, 13, 1, 0, 0).unwrap()),
            Some(25)
        );
        assert_eq!(
            axis.index_of(Utc.with_ymd_and_hms(2021, 10, 14, 0, 0, 0).unwrap()),
            None
        );
        assert_eq!(
            axis.index_of(Utc.with_ymd_and_hms(2021, 10, 11, 23, 0, 0).unwrap()),
            None
        );
        assert_eq!(
            axis.index_of(Utc.with_ymd_and_hms(2021, 10, 12, 0, 30, 0).unwrap()),
            None
        );
    }
}
