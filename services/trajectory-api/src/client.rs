//! HTTP client for the trajectory API.

use std::time::Duration;

use grid_cache::TrajectoryTable;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::error::ErrorBody;

/// Errors returned by [`TrajectoryClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Server {
        status: StatusCode,
        message: String,
        retryable: bool,
    },
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Serialize)]
struct FlightRequestRef<'a> {
    data: &'a TrajectoryTable,
}

/// Submits trajectories to a running trajectory API.
#[derive(Debug, Clone)]
pub struct TrajectoryClient {
    base_url: String,
    client: Client,
}

impl TrajectoryClient {
    /// Create a client for the server at `base_url` (e.g. `http://localhost:9800`).
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        // Interpolation may trigger a long sync on first use.
        Self::with_timeout(base_url, Duration::from_secs(3600))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a trajectory and return it augmented with the interpolated fields.
    #[instrument(skip(self, table), fields(rows = table.len()))]
    pub async fn submit_flight(&self, table: &TrajectoryTable) -> ClientResult<TrajectoryTable> {
        let url = format!("{}/submit_flight/", self.base_url);
        debug!(url = %url, "Submitting flight");

        let response = self
            .client
            .post(&url)
            .json(&FlightRequestRef { data: table })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<TrajectoryTable>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let (message, retryable) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error, body.retryable),
            Err(_) => (text, status == StatusCode::SERVICE_UNAVAILABLE),
        };
        Err(ClientError::Server {
            status,
            message,
            retryable,
        })
    }

    /// `true` when `/health` answers with a success status.
    pub async fn health(&self) -> ClientResult<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
