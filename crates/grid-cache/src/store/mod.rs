//! Local chunked cache store.
//!
//! A Zarr V3 hierarchy on the local filesystem holding a subset of the
//! remote dataset: fixed fields, levels and horizontal grid, growing one
//! hour at a time along the time axis.
//!
//! Hours are appended to physical slots in arrival order and never
//! rewritten. The `time` array is written last on every append, so an
//! interrupted append leaves the store as it was before the call.

mod layout;

pub use layout::{StoreLayout, FORMAT_VERSION, LAYOUT_ATTRIBUTE};

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use zarrs::array::Array;
use zarrs::array_subset::ArraySubset;
use zarrs::group::{Group, GroupBuilder};
use zarrs_filesystem::FilesystemStore;

use crate::config::CacheConfig;
use crate::error::{GridCacheError, Result};
use crate::types::{from_seconds, BoundingBox, GridCube, HourlyGrid};
use layout::ArrayFactory;

/// How a store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// A contiguous run of longitude columns and the offset added to their
/// coordinates when cropped across the antimeridian.
#[derive(Debug, Clone, PartialEq)]
struct LonSegment {
    columns: Range<usize>,
    offset: f64,
}

/// Handle on an opened local store.
pub struct LocalCacheStore {
    path: PathBuf,
    mode: AccessMode,
    layout: StoreLayout,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
    time_array: Array<FilesystemStore>,
    field_arrays: BTreeMap<String, Array<FilesystemStore>>,
    /// Unix seconds of each committed slot, in append order.
    slots: Vec<i64>,
    /// Unix seconds to slot.
    index: BTreeMap<i64, u64>,
}

impl std::fmt::Debug for LocalCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacheStore")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("hours", &self.slots.len())
            .finish()
    }
}

impl LocalCacheStore {
    /// Whether a store exists at the path.
    pub fn exists(path: &Path) -> bool {
        path.join("zarr.json").is_file()
    }

    /// Open an existing store. Returns `Ok(None)` if there is none.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path, mode: AccessMode) -> Result<Option<Self>> {
        if !Self::exists(path) {
            return Ok(None);
        }

        let storage = Arc::new(
            FilesystemStore::new(path).map_err(|e| GridCacheError::storage_error(e.to_string()))?,
        );

        let group =
            Group::open(storage.clone(), "/").map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        let layout_json = group.attributes().get(LAYOUT_ATTRIBUTE).ok_or_else(|| {
            GridCacheError::invalid_metadata(format!(
                "{} has no {} attribute",
                path.display(),
                LAYOUT_ATTRIBUTE
            ))
        })?;
        let layout = StoreLayout::from_json(layout_json)?;
        if layout.format_version != FORMAT_VERSION {
            return Err(GridCacheError::invalid_metadata(format!(
                "unsupported store format version {}",
                layout.format_version
            )));
        }

        let levels = read_axis(&open_array(&storage, "/level")?)?;
        if levels.len() != layout.levels.len() {
            return Err(GridCacheError::invalid_metadata(
                "level array disagrees with store attributes",
            ));
        }
        let latitudes = read_axis(&open_array(&storage, "/latitude")?)?;
        let longitudes = read_axis(&open_array(&storage, "/longitude")?)?;

        let time_array = open_array(&storage, "/time")?;
        let committed = time_array.shape()[0];
        let slots: Vec<i64> = if committed > 0 {
            let subset = ArraySubset::new_with_start_shape(vec![0], vec![committed])
                .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
            time_array
                .retrieve_array_subset_elements::<i64>(&subset)
                .map_err(|e| GridCacheError::zarr_error(e.to_string()))?
        } else {
            Vec::new()
        };

        let mut index = BTreeMap::new();
        for (slot, secs) in slots.iter().enumerate() {
            if index.insert(*secs, slot as u64).is_some() {
                return Err(GridCacheError::invalid_metadata(format!(
                    "hour {} appears twice in the time array",
                    from_seconds(*secs)
                )));
            }
        }

        let mut field_arrays = BTreeMap::new();
        for field in &layout.fields {
            let array = open_array(&storage, &format!("/{}", field))?;
            let shape = array.shape();
            if shape.len() != 4
                || shape[0] < committed
                || shape[1] as usize != layout.levels.len()
                || shape[2] as usize != latitudes.len()
                || shape[3] as usize != longitudes.len()
            {
                return Err(GridCacheError::invalid_metadata(format!(
                    "field {} has shape {:?}",
                    field, shape
                )));
            }
            field_arrays.insert(field.clone(), array);
        }

        debug!(hours = slots.len(), fields = field_arrays.len(), "Opened cache store");

        Ok(Some(Self {
            path: path.to_path_buf(),
            mode,
            layout,
            latitudes,
            longitudes,
            time_array,
            field_arrays,
            slots,
            index,
        }))
    }

    /// Create a new store from its first hour.
    ///
    /// The layout (fields, levels, horizontal grid) is fixed from `first`
    /// and `config`. The group metadata is written last, so a crash during
    /// creation leaves no openable store behind.
    #[instrument(skip_all, fields(path = %path.display(), hour = %first.time))]
    pub fn create(
        path: &Path,
        first: &HourlyGrid,
        config: &CacheConfig,
        source: &str,
    ) -> Result<Self> {
        if Self::exists(path) {
            return Err(GridCacheError::storage_error(format!(
                "a store already exists at {}",
                path.display()
            )));
        }
        first.validate()?;
        for field in &config.fields {
            if !first.fields.contains_key(field) {
                return Err(GridCacheError::invalid_metadata(format!(
                    "first hour has no values for field {}",
                    field
                )));
            }
        }

        std::fs::create_dir_all(path)?;
        let storage = Arc::new(
            FilesystemStore::new(path).map_err(|e| GridCacheError::storage_error(e.to_string()))?,
        );
        let factory = ArrayFactory::new(config);

        let layout = StoreLayout {
            format_version: FORMAT_VERSION,
            fields: config.fields.clone(),
            levels: first.levels.clone(),
            latitude_count: first.latitudes.len(),
            longitude_count: first.longitudes.len(),
            chunk_size: config.chunk_size,
            compression: config.compression,
            created_at: Utc::now(),
            source: source.to_string(),
        };

        for (name, values) in [
            ("level", &first.levels),
            ("latitude", &first.latitudes),
            ("longitude", &first.longitudes),
        ] {
            let array = factory.coordinate(storage.clone(), name, values.len())?;
            write_axis(&array, values)?;
            array
                .store_metadata()
                .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        }

        let shape = [
            1,
            first.levels.len() as u64,
            first.latitudes.len() as u64,
            first.longitudes.len() as u64,
        ];
        let mut field_arrays = BTreeMap::new();
        for field in &layout.fields {
            let array = factory.field(storage.clone(), field, shape)?;
            field_arrays.insert(field.clone(), array);
        }
        let time_array = factory.time(storage.clone(), 1)?;

        let mut store = Self {
            path: path.to_path_buf(),
            mode: AccessMode::ReadWrite,
            layout,
            latitudes: first.latitudes.clone(),
            longitudes: first.longitudes.clone(),
            time_array,
            field_arrays,
            slots: Vec::new(),
            index: BTreeMap::new(),
        };
        store.write_slot(0, first)?;

        let mut attrs = serde_json::Map::new();
        attrs.insert(LAYOUT_ATTRIBUTE.to_string(), store.layout.to_json()?);
        let mut builder = GroupBuilder::new();
        builder.attributes(attrs);
        let group = builder
            .build(storage, "/")
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        group
            .store_metadata()
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

        store.commit(0, first.time);
        info!(
            fields = store.layout.fields.len(),
            levels = store.layout.levels.len(),
            lat = store.latitudes.len(),
            lon = store.longitudes.len(),
            "Created cache store"
        );

        Ok(store)
    }

    /// Append one hour after the ones already stored.
    ///
    /// Hours may arrive in any order; each lands in the next free slot.
    #[instrument(skip_all, fields(hour = %grid.time))]
    pub fn append(&mut self, grid: &HourlyGrid) -> Result<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(GridCacheError::storage_error("store is opened read-only"));
        }
        if self.contains_hour(grid.time) {
            return Err(GridCacheError::DuplicateHour(grid.time));
        }
        grid.validate()?;
        self.check_compatible(grid)?;

        let slot = self.slots.len() as u64;
        self.write_slot(slot, grid)?;
        self.commit(slot, grid.time);

        debug!(slot, "Appended hour");
        Ok(())
    }

    /// Whether the hour is committed to the store.
    pub fn contains_hour(&self, hour: DateTime<Utc>) -> bool {
        self.index.contains_key(&hour.timestamp())
    }

    /// Stored hours, sorted ascending regardless of append order.
    pub fn times(&self) -> Vec<DateTime<Utc>> {
        self.index.keys().copied().map(from_seconds).collect()
    }

    /// Stored hours in physical slot order, as written to the `time` array.
    pub fn slot_times(&self) -> Vec<DateTime<Utc>> {
        self.slots.iter().copied().map(from_seconds).collect()
    }

    /// Number of stored hours.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn latitudes(&self) -> &[f64] {
        &self.latitudes
    }

    pub fn longitudes(&self) -> &[f64] {
        &self.longitudes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail with `ConfigMismatch` unless every requested field and level is
    /// part of the store layout.
    pub fn validate_request(&self, fields: &[String], levels: &[f64]) -> Result<()> {
        self.layout.check_request(fields, levels)
    }

    /// Read the given fields for the stored subset of `hours` inside a
    /// geographic window.
    ///
    /// Hours not in the store are left out of the cube. On a global grid
    /// the window may extend past either longitude end; the wrapped
    /// columns come back with coordinates shifted by 360 degrees.
    #[instrument(skip_all, fields(fields = fields.len(), hours = hours.len()))]
    pub fn crop(
        &self,
        fields: &[String],
        hours: &[DateTime<Utc>],
        window: &BoundingBox,
    ) -> Result<GridCube> {
        self.layout.check_request(fields, &[])?;

        let mut selected: Vec<(i64, u64)> = hours
            .iter()
            .filter_map(|h| {
                let secs = h.timestamp();
                self.index.get(&secs).map(|&slot| (secs, slot))
            })
            .collect();
        selected.sort_unstable();
        selected.dedup();

        let rows = index_range(&self.latitudes, window.min_lat, window.max_lat);
        let segments = self.longitude_segments(window);

        let mut cube = GridCube {
            times: selected.iter().map(|(secs, _)| from_seconds(*secs)).collect(),
            levels: self.layout.levels.clone(),
            latitudes: rows
                .clone()
                .map(|r| self.latitudes[r].to_vec())
                .unwrap_or_default(),
            longitudes: segments
                .iter()
                .flat_map(|s| self.longitudes[s.columns.clone()].iter().map(move |x| x + s.offset))
                .collect(),
            fields: BTreeMap::new(),
        };

        let rows = match rows {
            Some(rows) if !cube.is_empty() => rows,
            _ => {
                for field in fields {
                    cube.fields.insert(field.clone(), Vec::new());
                }
                return Ok(cube);
            }
        };

        let [nt, nl, ny, nx] = cube.shape();
        for field in fields {
            let array = self.field_array(field)?;
            let mut data = vec![f32::NAN; nt * nl * ny * nx];

            for (ti, (_, slot)) in selected.iter().enumerate() {
                let mut column = 0;
                for segment in &segments {
                    let width = segment.columns.len();
                    let subset = ArraySubset::new_with_start_shape(
                        vec![*slot, 0, rows.start as u64, segment.columns.start as u64],
                        vec![1, nl as u64, ny as u64, width as u64],
                    )
                    .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
                    let block = array
                        .retrieve_array_subset_elements::<f32>(&subset)
                        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

                    for l in 0..nl {
                        for y in 0..ny {
                            let src = (l * ny + y) * width;
                            let dst = cube.offset([ti, l, y, column]);
                            data[dst..dst + width].copy_from_slice(&block[src..src + width]);
                        }
                    }
                    column += width;
                }
            }

            cube.fields.insert(field.clone(), data);
        }

        metrics::counter!("grid_cache_crop_total").increment(1);
        Ok(cube)
    }

    /// Flush metadata and release the handle.
    pub fn close(self) -> Result<()> {
        if self.mode == AccessMode::ReadWrite {
            for array in self.field_arrays.values() {
                array
                    .store_metadata()
                    .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
            }
            self.time_array
                .store_metadata()
                .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        }
        debug!(path = %self.path.display(), hours = self.slots.len(), "Closed cache store");
        Ok(())
    }

    fn field_array(&self, field: &str) -> Result<&Array<FilesystemStore>> {
        self.field_arrays.get(field).ok_or_else(|| {
            GridCacheError::config_mismatch(format!("field {} is not in the store", field))
        })
    }

    fn check_compatible(&self, grid: &HourlyGrid) -> Result<()> {
        if grid.levels.len() != self.layout.levels.len()
            || grid
                .levels
                .iter()
                .zip(&self.layout.levels)
                .any(|(a, b)| (a - b).abs() > 1e-6)
        {
            return Err(GridCacheError::config_mismatch(format!(
                "hour {} has levels {:?}, store has {:?}",
                grid.time, grid.levels, self.layout.levels
            )));
        }
        if grid.latitudes.len() != self.latitudes.len()
            || grid.longitudes.len() != self.longitudes.len()
        {
            return Err(GridCacheError::config_mismatch(format!(
                "hour {} has a {}x{} grid, store has {}x{}",
                grid.time,
                grid.latitudes.len(),
                grid.longitudes.len(),
                self.latitudes.len(),
                self.longitudes.len()
            )));
        }
        for field in &self.layout.fields {
            if !grid.fields.contains_key(field) {
                return Err(GridCacheError::config_mismatch(format!(
                    "hour {} has no values for field {}",
                    grid.time, field
                )));
            }
        }
        Ok(())
    }

    /// Write every field for one slot, then the time coordinate.
    fn write_slot(&mut self, slot: u64, grid: &HourlyGrid) -> Result<()> {
        let nl = self.layout.levels.len() as u64;
        let ny = self.latitudes.len() as u64;
        let nx = self.longitudes.len() as u64;

        let subset = ArraySubset::new_with_start_shape(vec![slot, 0, 0, 0], vec![1, nl, ny, nx])
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

        for (field, array) in self.field_arrays.iter_mut() {
            let values = grid.fields.get(field).ok_or_else(|| {
                GridCacheError::config_mismatch(format!("missing values for field {}", field))
            })?;

            if array.shape()[0] < slot + 1 {
                array.set_shape(vec![slot + 1, nl, ny, nx]);
            }
            array
                .store_array_subset_elements::<f32>(&subset, values)
                .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
            array
                .store_metadata()
                .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        }

        let secs = grid.time.timestamp();
        let time_subset = ArraySubset::new_with_start_shape(vec![slot], vec![1])
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        self.time_array.set_shape(vec![slot + 1]);
        self.time_array
            .store_array_subset_elements::<i64>(&time_subset, &[secs])
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
        self.time_array
            .store_metadata()
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;

        metrics::counter!("grid_cache_hours_written_total").increment(1);
        Ok(())
    }

    fn commit(&mut self, slot: u64, hour: DateTime<Utc>) {
        let secs = hour.timestamp();
        self.slots.push(secs);
        self.index.insert(secs, slot);
    }

    /// Longitude column runs covering the window.
    fn longitude_segments(&self, window: &BoundingBox) -> Vec<LonSegment> {
        let lons = &self.longitudes;
        let mut segments = Vec::new();
        let global = is_global(lons);

        let (axis_min, axis_max) = match (
            lons.iter().copied().reduce(f64::min),
            lons.iter().copied().reduce(f64::max),
        ) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => return segments,
        };

        if global && window.min_lon < axis_min {
            if let Some(columns) = index_range(lons, window.min_lon + 360.0, f64::INFINITY) {
                segments.push(LonSegment {
                    columns,
                    offset: -360.0,
                });
            }
        }
        if let Some(columns) = index_range(lons, window.min_lon, window.max_lon) {
            segments.push(LonSegment { columns, offset: 0.0 });
        }
        if global && window.max_lon > axis_max {
            if let Some(columns) = index_range(lons, f64::NEG_INFINITY, window.max_lon - 360.0) {
                segments.push(LonSegment {
                    columns,
                    offset: 360.0,
                });
            }
        }

        segments
    }
}

/// Index run of the values lying in `[lo, hi]`, for a monotonic axis.
fn index_range(values: &[f64], lo: f64, hi: f64) -> Option<Range<usize>> {
    let first = values.iter().position(|v| *v >= lo && *v <= hi)?;
    let last = values.iter().rposition(|v| *v >= lo && *v <= hi)?;
    Some(first..last + 1)
}

/// Whether a longitude axis wraps all the way around the globe.
fn is_global(lons: &[f64]) -> bool {
    if lons.len() < 2 {
        return false;
    }
    let step = (lons[1] - lons[0]).abs();
    let lo = lons.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = lons.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    hi - lo + step >= 360.0 - 1e-6
}

fn open_array(storage: &Arc<FilesystemStore>, path: &str) -> Result<Array<FilesystemStore>> {
    Array::open(storage.clone(), path)
        .map_err(|e| GridCacheError::invalid_metadata(format!("{}: {}", path, e)))
}

fn read_axis(array: &Array<FilesystemStore>) -> Result<Vec<f64>> {
    let len = array.shape().first().copied().unwrap_or(0);
    if len == 0 {
        return Ok(Vec::new());
    }
    let subset = ArraySubset::new_with_start_shape(vec![0], vec![len])
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
    array
        .retrieve_array_subset_elements::<f64>(&subset)
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))
}

fn write_axis(array: &Array<FilesystemStore>, values: &[f64]) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let subset = ArraySubset::new_with_start_shape(vec![0], vec![values.len() as u64])
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))?;
    array
        .store_array_subset_elements(&subset, values)
        .map_err(|e| GridCacheError::zarr_error(e.to_string()))
}
