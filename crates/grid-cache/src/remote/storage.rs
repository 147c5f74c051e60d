//! HTTP(S) storage backend for remote Zarr access.
//!
//! Wraps an `object_store` HTTP client in the async-to-sync adapter so the
//! synchronous zarrs API can read from it.

use std::sync::Arc;

use object_store::http::{HttpBuilder, HttpStore};
use object_store::ClientOptions;
use zarrs_object_store::AsyncObjectStore;
use zarrs_storage::storage_adapter::async_to_sync::{
    AsyncToSyncBlockOn, AsyncToSyncStorageAdapter,
};

use crate::error::{GridCacheError, Result};

/// Blocking executor that works from within a tokio runtime.
///
/// Uses `tokio::task::block_in_place` to move the current task to a blocking
/// thread, then uses the runtime handle to drive the future.
#[derive(Clone, Copy)]
pub struct TokioBlockOn;

impl AsyncToSyncBlockOn for TokioBlockOn {
    fn block_on<F: core::future::Future>(&self, future: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
    }
}

/// Storage type alias for HTTP-backed Zarr access (sync adapter).
pub type HttpStorage = AsyncToSyncStorageAdapter<AsyncObjectStore<HttpStore>, TokioBlockOn>;

/// Create an HTTP storage backend rooted at a Zarr hierarchy URL.
///
/// `gs://bucket/path` URLs are rewritten to the public
/// `https://storage.googleapis.com/bucket/path` endpoint.
pub fn create_http_storage(url: &str) -> Result<Arc<HttpStorage>> {
    let url = normalize_url(url);

    let http = HttpBuilder::new()
        .with_url(url.as_str())
        .with_client_options(ClientOptions::new().with_allow_http(true))
        .build()
        .map_err(|e| {
            GridCacheError::remote_unavailable(format!(
                "failed to create HTTP client for {}: {}",
                url, e
            ))
        })?;

    let async_store = Arc::new(AsyncObjectStore::new(http));
    let sync_store = AsyncToSyncStorageAdapter::new(async_store, TokioBlockOn);

    Ok(Arc::new(sync_store))
}

fn normalize_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    match url.strip_prefix("gs://") {
        Some(rest) => format!("https://storage.googleapis.com/{}", rest),
        None => url.to_string(),
    }
}
