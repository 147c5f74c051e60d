//! Configuration for the grid cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GridCacheError, Result};

/// Public ARCO-ERA5 hourly 0.25 degree store with 37 pressure levels.
pub const DEFAULT_REMOTE_URL: &str =
    "https://storage.googleapis.com/gcp-public-data-arco-era5/ar/full_37-1h-0p25deg-chunk-1.zarr-v3";

/// Fields cached when none are configured.
pub const DEFAULT_FIELDS: [&str; 4] = [
    "u_component_of_wind",
    "v_component_of_wind",
    "temperature",
    "specific_humidity",
];

/// Standard pressure levels (hPa) from 100 to 1000.
pub const DEFAULT_LEVELS: [f64; 27] = [
    100.0, 125.0, 150.0, 175.0, 200.0, 225.0, 250.0, 300.0, 350.0, 400.0, 450.0, 500.0, 550.0,
    600.0, 650.0, 700.0, 750.0, 775.0, 800.0, 825.0, 850.0, 875.0, 900.0, 925.0, 950.0, 975.0,
    1000.0,
];

/// Configuration for the cache, the sync engine and the trajectory engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory of the local Zarr store.
    pub local_store: PathBuf,

    /// Root URL of the remote Zarr dataset.
    pub remote_url: String,

    /// Fields to cache and interpolate.
    pub fields: Vec<String>,

    /// Pressure levels (hPa) to cache.
    pub levels: Vec<f64>,

    /// Unit of the trajectory `altitude` column.
    pub altitude_unit: AltitudeUnit,

    /// Spatial chunk edge (latitude and longitude) of the local store.
    pub chunk_size: usize,

    /// Compression codec for the local store.
    pub compression: ZarrCompression,

    /// Compression level (1-9).
    pub compression_level: u8,

    /// Enable byte shuffle filter for better compression.
    pub shuffle: bool,

    /// Upper bound for a single remote hour fetch.
    pub fetch_timeout_secs: u64,

    /// Retries for a retryable remote failure.
    pub max_retries: u32,

    /// Initial retry delay (doubles each retry).
    pub initial_retry_delay_ms: u64,

    /// Maximum retry delay.
    pub max_retry_delay_ms: u64,

    /// Number of hours fetched concurrently from the remote.
    pub fetch_concurrency: usize,

    /// Margin (degrees) added around the trajectory bounding box when cropping.
    pub spatial_margin_deg: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_store: PathBuf::new(),
            remote_url: DEFAULT_REMOTE_URL.to_string(),
            fields: DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            levels: DEFAULT_LEVELS.to_vec(),
            altitude_unit: AltitudeUnit::Feet,
            chunk_size: 256,
            compression: ZarrCompression::BloscZstd,
            compression_level: 1,
            shuffle: true,
            fetch_timeout_secs: 300,
            max_retries: 3,
            initial_retry_delay_ms: 2_000,
            max_retry_delay_ms: 60_000,
            fetch_concurrency: 1,
            spatial_margin_deg: 1.0,
        }
    }
}

impl CacheConfig {
    /// Default configuration pointing at the given store directory.
    pub fn with_local_store(path: impl Into<PathBuf>) -> Self {
        Self {
            local_store: path.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GridCacheError::invalid_config(format!("failed to read {}: {}", path.display(), e))
        })?;

        serde_yaml::from_str(&content).map_err(|e| {
            GridCacheError::invalid_config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Load configuration from environment variables on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `GRID_CACHE_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("GRID_CACHE_LOCAL_STORE") {
            self.local_store = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("GRID_CACHE_REMOTE_URL") {
            self.remote_url = val;
        }

        if let Ok(val) = std::env::var("GRID_CACHE_FIELDS") {
            self.fields = parse_list(&val);
        }

        if let Ok(val) = std::env::var("GRID_CACHE_LEVELS") {
            let levels: Option<Vec<f64>> = parse_list(&val)
                .iter()
                .map(|v| v.parse().ok())
                .collect();
            if let Some(levels) = levels {
                self.levels = levels;
            }
        }

        if let Ok(val) = std::env::var("GRID_CACHE_ALTITUDE_UNIT") {
            if let Some(unit) = AltitudeUnit::parse(&val) {
                self.altitude_unit = unit;
            }
        }

        if let Ok(val) = std::env::var("GRID_CACHE_CHUNK_SIZE") {
            if let Ok(size) = val.parse() {
                self.chunk_size = size;
            }
        }

        if let Ok(val) = std::env::var("GRID_CACHE_COMPRESSION") {
            self.compression = ZarrCompression::from_str(&val);
        }

        if let Ok(val) = std::env::var("GRID_CACHE_COMPRESSION_LEVEL") {
            if let Ok(level) = val.parse() {
                self.compression_level = level;
            }
        }

        if let Ok(val) = std::env::var("GRID_CACHE_FETCH_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.fetch_timeout_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("GRID_CACHE_MAX_RETRIES") {
            if let Ok(retries) = val.parse() {
                self.max_retries = retries;
            }
        }

        if let Ok(val) = std::env::var("GRID_CACHE_FETCH_CONCURRENCY") {
            if let Ok(n) = val.parse() {
                self.fetch_concurrency = n;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.local_store.as_os_str().is_empty() {
            return Err(GridCacheError::invalid_config("local_store must be set"));
        }

        if self.fields.is_empty() {
            return Err(GridCacheError::invalid_config("at least one field is required"));
        }

        if let Some(dup) = first_duplicate(&self.fields) {
            return Err(GridCacheError::invalid_config(format!(
                "field {} is listed twice",
                dup
            )));
        }

        if self.levels.is_empty() {
            return Err(GridCacheError::invalid_config("at least one level is required"));
        }

        if self.levels.iter().any(|l| !l.is_finite() || *l <= 0.0) {
            return Err(GridCacheError::invalid_config(
                "levels must be positive pressures in hPa",
            ));
        }

        for (i, a) in self.levels.iter().enumerate() {
            if self.levels[i + 1..].iter().any(|b| (a - b).abs() < 1e-9) {
                return Err(GridCacheError::invalid_config(format!(
                    "level {} is listed twice",
                    a
                )));
            }
        }

        if self.chunk_size == 0 {
            return Err(GridCacheError::invalid_config("chunk_size must be > 0"));
        }

        if self.compression != ZarrCompression::None
            && (self.compression_level == 0 || self.compression_level > 9)
        {
            return Err(GridCacheError::invalid_config(
                "compression_level must be 1-9",
            ));
        }

        if self.fetch_concurrency == 0 {
            return Err(GridCacheError::invalid_config("fetch_concurrency must be > 0"));
        }

        if !self.spatial_margin_deg.is_finite() || self.spatial_margin_deg < 0.0 {
            return Err(GridCacheError::invalid_config(
                "spatial_margin_deg must be >= 0",
            ));
        }

        Ok(())
    }

    /// Remote fetch timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Initial retry delay.
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    /// Maximum retry delay.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn first_duplicate(values: &[String]) -> Option<&str> {
    values
        .iter()
        .enumerate()
        .find(|(i, v)| values[..*i].contains(v))
        .map(|(_, v)| v.as_str())
}

/// Unit of trajectory altitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AltitudeUnit {
    /// Feet (flight level convention).
    #[default]
    Feet,
    /// Meters.
    Meters,
}

impl AltitudeUnit {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ft" | "feet" => Some(Self::Feet),
            "m" | "meters" | "metres" => Some(Self::Meters),
            _ => None,
        }
    }

    /// Convert a value in this unit to meters.
    pub fn to_meters(self, value: f64) -> f64 {
        match self {
            Self::Feet => value * crate::aero::FT,
            Self::Meters => value,
        }
    }
}

/// Compression codec for the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZarrCompression {
    /// No compression.
    None,
    /// Blosc with LZ4.
    BloscLz4,
    /// Blosc with Zstd (recommended).
    #[default]
    BloscZstd,
}

impl ZarrCompression {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => Self::None,
            "lz4" | "blosc_lz4" => Self::BloscLz4,
            _ => Self::BloscZstd,
        }
    }

    /// Get the codec name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BloscLz4 => "blosc_lz4",
            Self::BloscZstd => "blosc_zstd",
        }
    }
}

impl std::fmt::Display for ZarrCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
