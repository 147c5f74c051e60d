//! On-disk layout of the local cache store.
//!
//! ```text
//! <store>/
//!   zarr.json            group, attributes["grid_cache"] = StoreLayout
//!   level/               f64 [level]
//!   latitude/            f64 [latitude]
//!   longitude/           f64 [longitude]
//!   time/                i64 [slot]   Unix seconds, committed last
//!   <field>/             f32 [slot, level, latitude, longitude]
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs_filesystem::FilesystemStore;

use crate::config::{CacheConfig, ZarrCompression};
use crate::error::{GridCacheError, Result};

/// Group attribute holding the [`StoreLayout`].
pub const LAYOUT_ATTRIBUTE: &str = "grid_cache";

/// Layout version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Time slots per chunk of the `time` array.
const TIME_CHUNK: u64 = 1024;

/// Fixed description of a store, decided when it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreLayout {
    pub format_version: u32,
    /// Cached fields, in array creation order.
    pub fields: Vec<String>,
    /// Pressure levels (hPa), in storage order.
    pub levels: Vec<f64>,
    pub latitude_count: usize,
    pub longitude_count: usize,
    pub chunk_size: usize,
    pub compression: ZarrCompression,
    pub created_at: DateTime<Utc>,
    /// Remote the store was bootstrapped from.
    pub source: String,
}

impl StoreLayout {
    /// Serialize to JSON for the group attributes.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from the group attributes.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| GridCacheError::invalid_metadata(e.to_string()))
    }

    /// Check a request only asks for fields and levels this store holds.
    ///
    /// The store never grows new fields or levels; a mismatch is fatal.
    pub fn check_request(&self, fields: &[String], levels: &[f64]) -> Result<()> {
        let missing_fields: Vec<&str> = fields
            .iter()
            .filter(|f| !self.fields.contains(f))
            .map(String::as_str)
            .collect();
        if !missing_fields.is_empty() {
            return Err(GridCacheError::config_mismatch(format!(
                "fields {:?} are not in the store (store holds {:?})",
                missing_fields, self.fields
            )));
        }

        let missing_levels: Vec<f64> = levels
            .iter()
            .copied()
            .filter(|l| self.level_index(*l).is_none())
            .collect();
        if !missing_levels.is_empty() {
            return Err(GridCacheError::config_mismatch(format!(
                "levels {:?} are not in the store (store holds {:?})",
                missing_levels, self.levels
            )));
        }

        Ok(())
    }

    /// Position of a level in storage order.
    pub fn level_index(&self, level: f64) -> Option<usize> {
        self.levels.iter().position(|l| (l - level).abs() < 1e-6)
    }
}

/// Builds the store's arrays with the configured chunking and compression.
pub(crate) struct ArrayFactory<'a> {
    config: &'a CacheConfig,
}

impl<'a> ArrayFactory<'a> {
    pub(crate) fn new(config: &'a CacheConfig) -> Self {
        Self { config }
    }

    /// A 1D f64 coordinate array stored as a single chunk.
    pub(crate) fn coordinate(
        &self,
        storage: Arc<FilesystemStore>,
        name: &str,
        len: usize,
    ) -> Result<Array<FilesystemStore>> {
        let mut attrs = serde_json::Map::new();
        attrs.insert("_ARRAY_DIMENSIONS".to_string(), serde_json::json!([name]));

        let chunk_grid: zarrs::array::ChunkGrid = vec![len.max(1) as u64]
            .try_into()
            .map_err(|e| GridCacheError::invalid_config(format!("{:?}", e)))?;

        let mut binding = ArrayBuilder::new(
            vec![len as u64],
            DataType::Float64,
            chunk_grid,
            FillValue::from(f64::NAN),
        );
        let builder = binding.attributes(attrs);

        builder
            .build(storage, &format!("/{}", name))
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))
    }

    /// The `time` array, i64 Unix seconds per slot.
    pub(crate) fn time(
        &self,
        storage: Arc<FilesystemStore>,
        slots: u64,
    ) -> Result<Array<FilesystemStore>> {
        let mut attrs = serde_json::Map::new();
        attrs.insert("_ARRAY_DIMENSIONS".to_string(), serde_json::json!(["time"]));
        attrs.insert(
            "units".to_string(),
            serde_json::json!("seconds since 1970-01-01 00:00:00"),
        );

        let chunk_grid: zarrs::array::ChunkGrid = vec![TIME_CHUNK]
            .try_into()
            .map_err(|e| GridCacheError::invalid_config(format!("{:?}", e)))?;

        let mut binding = ArrayBuilder::new(
            vec![slots],
            DataType::Int64,
            chunk_grid,
            FillValue::from(i64::MIN),
        );
        let builder = binding.attributes(attrs);

        builder
            .build(storage, "/time")
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))
    }

    /// A 4D f32 field array chunked one hour and one level at a time.
    pub(crate) fn field(
        &self,
        storage: Arc<FilesystemStore>,
        name: &str,
        shape: [u64; 4],
    ) -> Result<Array<FilesystemStore>> {
        let mut attrs = serde_json::Map::new();
        attrs.insert(
            "_ARRAY_DIMENSIONS".to_string(),
            serde_json::json!(["time", "level", "latitude", "longitude"]),
        );

        let chunk = self.config.chunk_size as u64;
        let chunk_grid: zarrs::array::ChunkGrid = vec![
            1,
            1,
            chunk.min(shape[2]).max(1),
            chunk.min(shape[3]).max(1),
        ]
        .try_into()
        .map_err(|e| GridCacheError::invalid_config(format!("{:?}", e)))?;

        let mut binding = ArrayBuilder::new(
            shape.to_vec(),
            DataType::Float32,
            chunk_grid,
            FillValue::from(f32::NAN),
        );
        let mut builder = binding.attributes(attrs);

        if self.config.compression != ZarrCompression::None {
            let codec = self.create_compression_codec()?;
            builder = builder.bytes_to_bytes_codecs(vec![codec]);
        }

        builder
            .build(storage, &format!("/{}", name))
            .map_err(|e| GridCacheError::zarr_error(e.to_string()))
    }

    /// Create the compression codec based on configuration.
    fn create_compression_codec(
        &self,
    ) -> Result<Arc<dyn zarrs::array::codec::BytesToBytesCodecTraits>> {
        let level = BloscCompressionLevel::try_from(self.config.compression_level)
            .map_err(|_| GridCacheError::invalid_config("invalid compression level"))?;

        let shuffle = if self.config.shuffle {
            BloscShuffleMode::Shuffle
        } else {
            BloscShuffleMode::NoShuffle
        };

        // typesize is required when shuffle is enabled
        let typesize = if self.config.shuffle { Some(4) } else { None };

        let compressor = match self.config.compression {
            ZarrCompression::None => {
                return Err(GridCacheError::invalid_config("no compression configured"))
            }
            ZarrCompression::BloscLz4 => BloscCompressor::LZ4,
            ZarrCompression::BloscZstd => BloscCompressor::Zstd,
        };

        let codec = BloscCodec::new(compressor, level, None, shuffle, typesize)
            .map_err(|e| GridCacheError::invalid_config(e.to_string()))?;

        Ok(Arc::new(codec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StoreLayout {
        StoreLayout {
            format_version: FORMAT_VERSION,
            fields: vec!["temperature".to_string(), "specific_humidity".to_string()],
            levels: vec![300.0, 400.0, 500.0],
            latitude_count: 721,
            longitude_count: 1440,
            chunk_size: 256,
            compression: ZarrCompression::BloscZstd,
            created_at: Utc::now(),
            source: "test".to_string(),
        }
    }

    #[test]
    fn test_layout_json() {
        let layout = layout();
        let json = layout.to_json().unwrap();
        assert_eq!(json["compression"], "blosc_zstd");
        let restored = StoreLayout::from_json(&json).unwrap();
        assert_eq!(restored, layout);
    }

    #[test]
    fn test_check_request_subset_ok() {
        let layout = layout();
        assert!(layout
            .check_request(&["temperature".to_string()], &[400.0])
            .is_ok());
        assert!(layout
            .check_request(&layout.fields.clone(), &layout.levels.clone())
            .is_ok());
    }

    #[test]
    fn test_check_request_mismatch_is_fatal() {
        let layout = layout();

        let err = layout
            .check_request(&["u_component_of_wind".to_string()], &[400.0])
            .unwrap_err();
        assert!(matches!(err, GridCacheError::ConfigMismatch(_)));
        assert!(!err.is_retryable());

        let err = layout
            .check_request(&["temperature".to_string()], &[850.0])
            .unwrap_err();
        assert!(matches!(err, GridCacheError::ConfigMismatch(_)));
    }
}
