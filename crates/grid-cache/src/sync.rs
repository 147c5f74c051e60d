//! Incremental synchronization of the local store with the remote dataset.
//!
//! A sync call makes sure every hour boundary in `[floor(start), ceil(stop)]`
//! is present locally, fetching only the hours the store does not hold yet:
//! - Bootstrap the store from the earliest available hour when none exists
//! - Fail fast when the store's fixed fields/levels don't cover the config
//! - Fetch missing hours with timeout and exponential backoff retry
//! - Append in strictly increasing time order, then close the store

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::CacheConfig;
use crate::error::{GridCacheError, Result};
use crate::remote::RemoteGridSource;
use crate::store::{AccessMode, LocalCacheStore};
use crate::types::{hourly_range, HourlyGrid};

/// Outcome of one sync call.
///
/// Every requested hour ends up in exactly one of `fetched`,
/// `already_present` or `unavailable`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Hour boundaries covered by the call, increasing.
    pub requested: Vec<DateTime<Utc>>,
    /// Hours fetched from the remote and appended.
    pub fetched: Vec<DateTime<Utc>>,
    /// Hours the store already held.
    pub already_present: Vec<DateTime<Utc>>,
    /// Hours the remote had no data for.
    pub unavailable: Vec<DateTime<Utc>>,
    /// Whether this call created the store.
    pub bootstrapped: bool,
}

impl SyncReport {
    /// True when every requested hour is now in the store.
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }
}

/// Keeps one local store in step with a remote grid source.
///
/// Writers are serialized through an async lock; readers going through
/// [`SyncEngine::read_store`] never observe a half-finished sync.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<CacheConfig>,
    remote: Arc<dyn RemoteGridSource>,
    lock: Arc<RwLock<()>>,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(config: CacheConfig, remote: Arc<dyn RemoteGridSource>) -> Self {
        Self {
            config: Arc::new(config),
            remote,
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Bring the store up to date for `[floor(start), ceil(stop)]`.
    #[instrument(skip(self), fields(remote = %self.remote.describe()))]
    pub async fn sync(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<SyncReport> {
        let _guard = self.lock.write().await;
        let started = Instant::now();

        let hours = hourly_range(start, stop);
        let mut report = SyncReport {
            requested: hours.clone(),
            ..Default::default()
        };

        let path = self.config.local_store.clone();
        let existing =
            tokio::task::spawn_blocking(move || LocalCacheStore::open(&path, AccessMode::ReadWrite))
                .await??;

        let mut store = match existing {
            Some(store) => store,
            None => match self.bootstrap(&hours, &mut report).await? {
                Some(store) => store,
                None => {
                    warn!(
                        hours = hours.len(),
                        "No remote data for any requested hour, store not created"
                    );
                    return Ok(report);
                }
            },
        };

        store.validate_request(&self.config.fields, &self.config.levels)?;

        let mut missing = Vec::new();
        for hour in &hours {
            if report.fetched.contains(hour) || report.unavailable.contains(hour) {
                continue;
            }
            if store.contains_hour(*hour) {
                report.already_present.push(*hour);
            } else {
                missing.push(*hour);
            }
        }
        metrics::counter!("grid_cache_hours_skipped_total")
            .increment(report.already_present.len() as u64);

        debug!(
            missing = missing.len(),
            present = report.already_present.len(),
            "Reconciled requested range with store"
        );

        // The store holds the full layout; always fetch all of it.
        let fields = store.layout().fields.clone();
        let levels = store.layout().levels.clone();
        let (fields, levels) = (&fields, &levels);

        // `buffered` yields in submission order, so appends stay increasing.
        let mut fetches = stream::iter(missing.into_iter().map(|hour| async move {
            (hour, self.fetch_hour(hour, fields, levels).await)
        }))
        .buffered(self.config.fetch_concurrency.max(1));

        let mut failure = None;
        while let Some((hour, result)) = fetches.next().await {
            match result {
                Ok(Some(grid)) => match append_blocking(store, grid).await {
                    Ok(updated) => {
                        store = updated;
                        report.fetched.push(hour);
                        metrics::counter!("grid_cache_hours_fetched_total").increment(1);
                        info!(hour = %hour, "Fetched and appended hour");
                    }
                    Err(e) => return Err(e),
                },
                Ok(None) => {
                    warn!(hour = %hour, "No data available from remote for hour");
                    metrics::counter!("grid_cache_hours_unavailable_total").increment(1);
                    report.unavailable.push(hour);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(fetches);

        tokio::task::spawn_blocking(move || store.close()).await??;

        if let Some(e) = failure {
            return Err(e);
        }

        report.fetched.sort();
        report.unavailable.sort();

        info!(
            fetched = report.fetched.len(),
            present = report.already_present.len(),
            unavailable = report.unavailable.len(),
            bootstrapped = report.bootstrapped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync completed"
        );

        Ok(report)
    }

    /// Run a read-only operation against the store while no sync is writing.
    ///
    /// Returns `Ok(None)` when the store does not exist.
    pub async fn read_store<T, F>(&self, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&LocalCacheStore) -> Result<T> + Send + 'static,
    {
        let _guard = self.lock.read().await;
        let path = self.config.local_store.clone();

        tokio::task::spawn_blocking(move || {
            match LocalCacheStore::open(&path, AccessMode::ReadOnly)? {
                Some(store) => {
                    let value = f(&store)?;
                    store.close()?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })
        .await?
    }

    /// Create the store from the first hour of the range that has data.
    ///
    /// Hours are tried in increasing order from `floor(start)`, so every
    /// later append in the same call lands after the bootstrap hour. Only
    /// hours the remote answered empty are reported unavailable.
    async fn bootstrap(
        &self,
        hours: &[DateTime<Utc>],
        report: &mut SyncReport,
    ) -> Result<Option<LocalCacheStore>> {
        for &hour in hours {
            let Some(grid) = self
                .fetch_hour(hour, &self.config.fields, &self.config.levels)
                .await?
            else {
                warn!(hour = %hour, "No data available for bootstrap hour, trying next");
                metrics::counter!("grid_cache_hours_unavailable_total").increment(1);
                report.unavailable.push(hour);
                continue;
            };

            let path = self.config.local_store.clone();
            let config = self.config.clone();
            let source = self.remote.describe();
            let store = tokio::task::spawn_blocking(move || {
                LocalCacheStore::create(&path, &grid, &config, &source)
            })
            .await??;

            info!(hour = %hour, path = %self.config.local_store.display(), "Bootstrapped local store");
            metrics::counter!("grid_cache_hours_fetched_total").increment(1);
            report.bootstrapped = true;
            report.fetched.push(hour);
            return Ok(Some(store));
        }

        Ok(None)
    }

    /// Fetch one hour with a timeout, retrying retryable failures with
    /// exponential backoff.
    async fn fetch_hour(
        &self,
        hour: DateTime<Utc>,
        fields: &[String],
        levels: &[f64],
    ) -> Result<Option<HourlyGrid>> {
        let timeout = self.config.fetch_timeout();
        let mut retry_count = 0;
        let mut delay = self.config.initial_retry_delay();

        loop {
            let started = Instant::now();
            let result =
                match tokio::time::timeout(timeout, self.remote.select_hour(hour, fields, levels))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(GridCacheError::RemoteTimeout(timeout)),
                };
            metrics::histogram!("grid_cache_fetch_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok(grid) => return Ok(grid),
                Err(e) if e.is_retryable() && retry_count < self.config.max_retries => {
                    retry_count += 1;
                    metrics::counter!("grid_cache_fetch_retries_total").increment(1);

                    warn!(
                        hour = %hour,
                        error = %e,
                        retry = retry_count,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Remote fetch failed, retrying"
                    );

                    tokio::time::sleep(delay).await;

                    // Exponential backoff
                    delay = std::cmp::min(delay * 2, self.config.max_retry_delay());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn append_blocking(mut store: LocalCacheStore, grid: HourlyGrid) -> Result<LocalCacheStore> {
    tokio::task::spawn_blocking(move || {
        store.append(&grid)?;
        Ok(store)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::SyntheticGridSource;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 10, 12, h, 0, 0).unwrap()
    }

    fn engine(dir: &TempDir, source: SyntheticGridSource) -> (SyncEngine, Arc<SyntheticGridSource>) {
        let config = source.cache_config(dir.path().join("cache.zarr"));
        let source = Arc::new(source);
        (SyncEngine::new(config, source.clone()), source)
    }

    #[tokio::test]
    async fn test_bootstrap_then_fill() {
        let dir = TempDir::new().unwrap();
        let (engine, source) = engine(&dir, SyntheticGridSource::regional());

        let start = Utc.with_ymd_and_hms(2021, 10, 12, 1, 10, 0).unwrap();
        let stop = Utc.with_ymd_and_hms(2021, 10, 12, 1, 20, 0).unwrap();
        let report = engine.sync(start, stop).await.unwrap();

        assert!(report.bootstrapped);
        assert_eq!(report.requested, vec![hour(1), hour(2)]);
        assert_eq!(report.fetched, vec![hour(1), hour(2)]);
        assert!(report.is_complete());
        assert_eq!(source.requested_hours(), vec![hour(1), hour(2)]);
    }

    #[tokio::test]
    async fn test_second_sync_fetches_nothing() {
        let dir = TempDir::new().unwrap();
        let (engine, source) = engine(&dir, SyntheticGridSource::regional());

        engine.sync(hour(1), hour(3)).await.unwrap();
        let report = engine.sync(hour(1), hour(3)).await.unwrap();

        assert!(!report.bootstrapped);
        assert!(report.fetched.is_empty());
        assert_eq!(report.already_present, vec![hour(1), hour(2), hour(3)]);
        assert_eq!(source.requested_hours().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_hour_is_reported_and_retried_later() {
        let dir = TempDir::new().unwrap();
        let (engine, source) = engine(&dir, SyntheticGridSource::regional().with_missing(hour(2)));

        let report = engine.sync(hour(1), hour(3)).await.unwrap();
        assert_eq!(report.fetched, vec![hour(1), hour(3)]);
        assert_eq!(report.unavailable, vec![hour(2)]);
        assert!(!report.is_complete());

        let report = engine.sync(hour(1), hour(3)).await.unwrap();
        assert_eq!(report.unavailable, vec![hour(2)]);
        assert_eq!(
            source.requested_hours().iter().filter(|h| **h == hour(2)).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_bootstrap_starts_at_floor_hour() {
        let dir = TempDir::new().unwrap();
        let (engine, source) = engine(&dir, SyntheticGridSource::regional().with_missing(hour(2)));

        let start = Utc.with_ymd_and_hms(2021, 10, 12, 1, 40, 0).unwrap();
        let stop = Utc.with_ymd_and_hms(2021, 10, 12, 1, 50, 0).unwrap();
        let report = engine.sync(start, stop).await.unwrap();

        assert!(report.bootstrapped);
        assert_eq!(report.fetched, vec![hour(1)]);
        assert_eq!(report.unavailable, vec![hour(2)]);
        assert_eq!(source.requested_hours(), vec![hour(1), hour(2)]);
        assert!(LocalCacheStore::exists(&engine.config().local_store));
    }

    #[tokio::test]
    async fn test_late_start_appends_in_increasing_order() {
        let dir = TempDir::new().unwrap();
        let (engine, _source) = engine(&dir, SyntheticGridSource::regional());

        let start = Utc.with_ymd_and_hms(2021, 10, 12, 1, 40, 0).unwrap();
        let stop = Utc.with_ymd_and_hms(2021, 10, 12, 3, 10, 0).unwrap();
        engine.sync(start, stop).await.unwrap();

        let slots = engine
            .read_store(|store| Ok(store.slot_times()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slots, vec![hour(1), hour(2), hour(3), hour(4)]);
    }

    #[tokio::test]
    async fn test_bootstrap_walks_forward() {
        let dir = TempDir::new().unwrap();
        let (engine, _source) = engine(
            &dir,
            SyntheticGridSource::regional()
                .with_missing(hour(1))
                .with_missing(hour(2)),
        );

        let report = engine.sync(hour(1), hour(4)).await.unwrap();
        assert!(report.bootstrapped);
        assert_eq!(report.fetched, vec![hour(3), hour(4)]);
        assert_eq!(report.unavailable, vec![hour(1), hour(2)]);

        let times = engine
            .read_store(|store| Ok(store.times()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(times, vec![hour(3), hour(4)]);
    }

    #[tokio::test]
    async fn test_nothing_available_creates_no_store() {
        let dir = TempDir::new().unwrap();
        let (engine, _source) = engine(
            &dir,
            SyntheticGridSource::regional()
                .with_missing(hour(1))
                .with_missing(hour(2)),
        );

        let report = engine.sync(hour(1), hour(2)).await.unwrap();
        assert!(!report.bootstrapped);
        assert_eq!(report.unavailable, vec![hour(1), hour(2)]);
        assert!(!LocalCacheStore::exists(&engine.config().local_store));
        assert!(engine
            .read_store(|store| Ok(store.len()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let source = SyntheticGridSource::regional().with_transient_failures(2);
        let mut config = source.cache_config(dir.path().join("cache.zarr"));
        config.initial_retry_delay_ms = 1;
        config.max_retry_delay_ms = 2;
        let engine = SyncEngine::new(config, Arc::new(source));

        let report = engine.sync(hour(1), hour(1)).await.unwrap();
        assert_eq!(report.fetched, vec![hour(1)]);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_an_error() {
        let dir = TempDir::new().unwrap();
        let source = SyntheticGridSource::regional().with_transient_failures(10);
        let mut config = source.cache_config(dir.path().join("cache.zarr"));
        config.max_retries = 1;
        config.initial_retry_delay_ms = 1;
        config.max_retry_delay_ms = 1;
        let engine = SyncEngine::new(config, Arc::new(source));

        let err = engine.sync(hour(1), hour(1)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_concurrent_fetch_keeps_order() {
        let dir = TempDir::new().unwrap();
        let source = SyntheticGridSource::regional();
        let mut config = source.cache_config(dir.path().join("cache.zarr"));
        config.fetch_concurrency = 4;
        let engine = SyncEngine::new(config, Arc::new(source));

        let report = engine.sync(hour(0), hour(6)).await.unwrap();
        assert_eq!(report.fetched.len(), 7);
        let times = engine
            .read_store(|store| Ok(store.times()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(times, (0..=6).map(hour).collect::<Vec<_>>());
    }
}
