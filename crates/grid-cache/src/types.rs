//! Core types for the grid cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GridCacheError, Result};

/// Seconds in one sync hour.
pub const HOUR_SECONDS: i64 = 3600;

/// Truncate a timestamp to the start of its hour.
pub fn floor_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    from_seconds(t.timestamp().div_euclid(HOUR_SECONDS) * HOUR_SECONDS)
}

/// Smallest hour boundary at or after the timestamp.
pub fn ceil_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    let floor = floor_hour(t);
    if floor == t {
        floor
    } else {
        from_seconds(floor.timestamp() + HOUR_SECONDS)
    }
}

/// Every hour boundary in `[floor(start), ceil(stop)]`, increasing.
///
/// The bounds are swapped if given in reverse order.
pub fn hourly_range(start: DateTime<Utc>, stop: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let (start, stop) = if start <= stop { (start, stop) } else { (stop, start) };
    let first = floor_hour(start).timestamp();
    let last = ceil_hour(stop).timestamp();
    (first..=last)
        .step_by(HOUR_SECONDS as usize)
        .map(from_seconds)
        .collect()
}

/// Convert Unix seconds into a UTC timestamp.
pub fn from_seconds(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// A geographic window. Longitudes follow the grid's 0-360 convention and
/// may extend past either end when a margin is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Create a new bounding box.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Smallest box containing every (lon, lat) pair. `None` when empty.
    pub fn around(lons: &[f64], lats: &[f64]) -> Option<Self> {
        if lons.is_empty() || lats.is_empty() {
            return None;
        }

        let fold_min = |v: &[f64]| v.iter().copied().fold(f64::INFINITY, f64::min);
        let fold_max = |v: &[f64]| v.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(Self::new(
            fold_min(lons),
            fold_min(lats),
            fold_max(lons),
            fold_max(lats),
        ))
    }

    /// Check if a point is contained within this bounding box.
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    /// Expand the bounding box by a buffer amount (in degrees).
    pub fn expand(&self, buffer: f64) -> Self {
        Self {
            min_lon: self.min_lon - buffer,
            min_lat: self.min_lat - buffer,
            max_lon: self.max_lon + buffer,
            max_lat: self.max_lat + buffer,
        }
    }
}

/// One hour of every cached field on the full level/latitude/longitude grid.
///
/// Field values are row-major `[level][latitude][longitude]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyGrid {
    pub time: DateTime<Utc>,
    pub levels: Vec<f64>,
    pub latitudes: Vec<f64>,
    pub longitudes: Vec<f64>,
    pub fields: BTreeMap<String, Vec<f32>>,
}

impl HourlyGrid {
    /// Values per field (levels x latitudes x longitudes).
    pub fn field_len(&self) -> usize {
        self.levels.len() * self.latitudes.len() * self.longitudes.len()
    }

    /// Check every field has exactly one value per grid cell.
    pub fn validate(&self) -> Result<()> {
        let expected = self.field_len();
        for (name, values) in &self.fields {
            if values.len() != expected {
                return Err(GridCacheError::invalid_metadata(format!(
                    "field {} at {} has {} values, expected {}",
                    name,
                    self.time,
                    values.len(),
                    expected
                )));
            }
        }
        Ok(())
    }
}

/// A cropped 4D block of the cache held in memory.
///
/// Field values are row-major `[time][level][latitude][longitude]`.
/// Axes keep the store's ordering and need not be ascending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridCube {
    pub times: Vec<DateTime<Utc>>,
    pub levels: Vec<f64>,
    pub latitudes: Vec<f64>,
    pub longitudes: Vec<f64>,
    pub fields: BTreeMap<String, Vec<f32>>,
}

impl GridCube {
    /// Axis lengths `[time, level, latitude, longitude]`.
    pub fn shape(&self) -> [usize; 4] {
        [
            self.times.len(),
            self.levels.len(),
            self.latitudes.len(),
            self.longitudes.len(),
        ]
    }

    /// True when any axis is empty.
    pub fn is_empty(&self) -> bool {
        self.shape().iter().any(|&n| n == 0)
    }

    /// Flat offset of a `[time, level, latitude, longitude]` index.
    pub fn offset(&self, index: [usize; 4]) -> usize {
        let [_, nl, ny, nx] = self.shape();
        ((index[0] * nl + index[1]) * ny + index[2]) * nx + index[3]
    }

    /// Value of a field at a grid index.
    pub fn value(&self, field: &str, index: [usize; 4]) -> Option<f32> {
        self.fields.get(field)?.get(self.offset(index)).copied()
    }
}

/// Interpolation coordinate of one trajectory point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCoordinate {
    /// Unix seconds.
    pub time: f64,
    /// Pressure level (hPa).
    pub level: f64,
    pub latitude: f64,
    /// Longitude in `[0, 360)`.
    pub longitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 10, 12, h, m, s).unwrap()
    }

    #[test]
    fn test_hour_rounding() {
        assert_eq!(floor_hour(at(1, 10, 0)), at(1, 0, 0));
        assert_eq!(ceil_hour(at(1, 10, 0)), at(2, 0, 0));
        assert_eq!(ceil_hour(at(1, 0, 0)), at(1, 0, 0));
        assert_eq!(floor_hour(at(1, 59, 59)), at(1, 0, 0));
    }

    #[test]
    fn test_hourly_range() {
        let hours = hourly_range(at(1, 10, 0), at(1, 20, 0));
        assert_eq!(hours, vec![at(1, 0, 0), at(2, 0, 0)]);

        let exact = hourly_range(at(3, 0, 0), at(3, 0, 0));
        assert_eq!(exact, vec![at(3, 0, 0)]);

        let reversed = hourly_range(at(5, 30, 0), at(3, 15, 0));
        assert_eq!(reversed.first(), Some(&at(3, 0, 0)));
        assert_eq!(reversed.last(), Some(&at(6, 0, 0)));
        assert_eq!(reversed.len(), 4);
    }

    #[test]
    fn test_bbox_around_and_expand() {
        let bbox = BoundingBox::around(&[4.2, 6.6], &[40.3, 42.5]).unwrap().expand(1.0);
        assert!((bbox.min_lon - 3.2).abs() < 1e-9);
        assert!((bbox.max_lon - 7.6).abs() < 1e-9);
        assert!((bbox.min_lat - 39.3).abs() < 1e-9);
        assert!((bbox.max_lat - 43.5).abs() < 1e-9);
        assert!(bbox.contains(5.0, 41.0));
        assert!(!bbox.contains(8.0, 41.0));
        assert!(BoundingBox::around(&[], &[]).is_none());
    }

    #[test]
    fn test_hourly_grid_validate() {
        let mut grid = HourlyGrid {
            time: at(1, 0, 0),
            levels: vec![500.0, 300.0],
            latitudes: vec![40.0, 41.0, 42.0],
            longitudes: vec![4.0, 5.0],
            fields: BTreeMap::new(),
        };
        grid.fields.insert("temperature".to_string(), vec![0.0; 12]);
        assert!(grid.validate().is_ok());

        grid.fields.insert("specific_humidity".to_string(), vec![0.0; 11]);
        assert!(grid.validate().is_err());
    }

    #[test]
    fn test_cube_offset() {
        let mut cube = GridCube {
            times: vec![at(1, 0, 0), at(2, 0, 0)],
            levels: vec![300.0, 400.0, 500.0],
            latitudes: vec![40.0, 41.0],
            longitudes: vec![4.0, 5.0, 6.0, 7.0],
            fields: BTreeMap::new(),
        };
        let data: Vec<f32> = (0..48).map(|i| i as f32).collect();
        cube.fields.insert("t".to_string(), data);

        assert_eq!(cube.shape(), [2, 3, 2, 4]);
        assert_eq!(cube.offset([1, 2, 1, 3]), 47);
        assert_eq!(cube.value("t", [1, 0, 0, 0]), Some(24.0));
        assert_eq!(cube.value("missing", [0, 0, 0, 0]), None);
        assert!(!cube.is_empty());
        assert!(GridCube::default().is_empty());
    }
}
