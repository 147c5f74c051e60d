//! Remote grid source capability and its Zarr-over-HTTP implementation.

mod storage;
mod zarr;

pub use storage::{create_http_storage, HttpStorage, TokioBlockOn};
pub use zarr::{CfTimeUnits, ZarrRemoteSource};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::HourlyGrid;

/// Read-only access to the full remote dataset, one hour at a time.
///
/// Implementations must be idempotent and side-effect free. Returning
/// `Ok(None)` means the remote has no data for that hour, which is a valid
/// outcome and not an error.
#[async_trait]
pub trait RemoteGridSource: Send + Sync {
    /// Select a single hour of the given fields at the given pressure levels.
    ///
    /// # Arguments
    /// * `hour` - Hour boundary to fetch
    /// * `fields` - Field names, in the order the caller stores them
    /// * `levels` - Pressure levels (hPa), in the order the caller stores them
    async fn select_hour(
        &self,
        hour: DateTime<Utc>,
        fields: &[String],
        levels: &[f64],
    ) -> Result<Option<HourlyGrid>>;

    /// Human-readable identifier for logs.
    fn describe(&self) -> String;
}
