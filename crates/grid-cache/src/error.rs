//! Error types for the grid cache.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while syncing the cache or interpolating trajectories.
#[derive(Error, Debug)]
pub enum GridCacheError {
    /// The requested fields or levels do not match the fixed layout of an
    /// existing store. Never retried.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// Configuration values are missing or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transient failure talking to the remote dataset.
    #[error("remote source unavailable: {0}")]
    RemoteUnavailable(String),

    /// A remote fetch exceeded the configured timeout.
    #[error("remote fetch timed out after {0:?}")]
    RemoteTimeout(Duration),

    /// The remote dataset cannot satisfy the request (unknown field or
    /// level, unsupported layout).
    #[error("invalid remote request: {0}")]
    RemoteRequest(String),

    /// Zarr format error.
    #[error("Zarr format error: {0}")]
    ZarrError(String),

    /// Storage/IO error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// The local store metadata is missing or corrupt.
    #[error("invalid store metadata: {0}")]
    InvalidMetadata(String),

    /// The hour is already present in the local store.
    #[error("hour {0} is already present in the store")]
    DuplicateHour(DateTime<Utc>),

    /// The trajectory table is missing a required column or holds values
    /// that cannot be parsed.
    #[error("invalid trajectory: {0}")]
    InvalidTrajectory(String),
}

impl GridCacheError {
    /// Create a ConfigMismatch error.
    pub fn config_mismatch(msg: impl Into<String>) -> Self {
        Self::ConfigMismatch(msg.into())
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a RemoteUnavailable error.
    pub fn remote_unavailable(msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable(msg.into())
    }

    /// Create a RemoteRequest error.
    pub fn remote_request(msg: impl Into<String>) -> Self {
        Self::RemoteRequest(msg.into())
    }

    /// Create a ZarrError.
    pub fn zarr_error(msg: impl Into<String>) -> Self {
        Self::ZarrError(msg.into())
    }

    /// Create a StorageError.
    pub fn storage_error(msg: impl Into<String>) -> Self {
        Self::StorageError(msg.into())
    }

    /// Create an InvalidMetadata error.
    pub fn invalid_metadata(msg: impl Into<String>) -> Self {
        Self::InvalidMetadata(msg.into())
    }

    /// Create an InvalidTrajectory error.
    pub fn invalid_trajectory(msg: impl Into<String>) -> Self {
        Self::InvalidTrajectory(msg.into())
    }

    /// Whether the failed operation may succeed if attempted again.
    ///
    /// Only network hiccups and timeouts qualify; configuration and
    /// request errors are fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::RemoteTimeout(_))
    }
}

impl From<std::io::Error> for GridCacheError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for GridCacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidMetadata(err.to_string())
    }
}

impl From<tokio::task::JoinError> for GridCacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::StorageError(format!("blocking task failed: {}", err))
    }
}

/// Result type for grid cache operations.
pub type Result<T> = std::result::Result<T, GridCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GridCacheError::remote_unavailable("reset by peer").is_retryable());
        assert!(GridCacheError::RemoteTimeout(Duration::from_secs(5)).is_retryable());
        assert!(!GridCacheError::remote_request("unknown field").is_retryable());
        assert!(!GridCacheError::config_mismatch("levels differ").is_retryable());
        assert!(!GridCacheError::storage_error("disk full").is_retryable());
    }
}
