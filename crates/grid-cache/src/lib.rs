//! Gridded Cache & Trajectory Interpolation
//!
//! This crate keeps a local, incrementally synchronized Zarr copy of a large
//! remote reanalysis dataset (time × pressure level × latitude × longitude)
//! and interpolates its fields along flight trajectories.
//!
//! - **Incremental sync**: only hours missing locally are fetched
//! - **Append-only store**: hours are never rewritten, duplicates rejected
//! - **4D interpolation**: multilinear in time, level, latitude, longitude,
//!   with the level derived from altitude via the standard atmosphere
//!
//! # Architecture
//!
//! ```text
//! Trajectory table
//!      │
//!      ▼
//! TrajectoryEngine::interpolate(table)
//!      │
//!      ├─► SyncEngine::sync(start, stop)
//!      │         │
//!      │         ├─► hour present locally: skip
//!      │         │
//!      │         └─► hour missing: RemoteGridSource::select_hour → append
//!      │
//!      ├─► LocalCacheStore::crop(hours, bbox + margin) → GridCube
//!      │
//!      └─► Interpolator over (time, level(altitude), lat, lon)
//!               │
//!               ▼
//!          Table with one column per field
//! ```
//!
//! # Example
//!
//! ```ignore
//! use grid_cache::{CacheConfig, TrajectoryEngine, ZarrRemoteSource};
//!
//! let config = CacheConfig::with_local_store("/data/era5.zarr");
//! let remote = ZarrRemoteSource::connect(&config.remote_url).await?;
//! let engine = TrajectoryEngine::new(config, Arc::new(remote));
//!
//! let augmented = engine.interpolate(&table).await?;
//! ```

pub mod aero;
pub mod config;
pub mod engine;
pub mod error;
pub mod interpolation;
pub mod remote;
pub mod store;
pub mod sync;
pub mod testdata;
pub mod trajectory;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{AltitudeUnit, CacheConfig, ZarrCompression};
pub use engine::TrajectoryEngine;
pub use error::{GridCacheError, Result};
pub use interpolation::{Axis, FieldColumns, Interpolator, Stencil};
pub use remote::{create_http_storage, HttpStorage, RemoteGridSource, ZarrRemoteSource};
pub use store::{AccessMode, LocalCacheStore, StoreLayout};
pub use sync::{SyncEngine, SyncReport};
pub use trajectory::{normalize_longitude, parse_timestamp, FlightPoint, TrajectoryTable};
pub use types::{
    ceil_hour, floor_hour, hourly_range, BoundingBox, GridCoordinate, GridCube,
    HourlyGrid,
};
