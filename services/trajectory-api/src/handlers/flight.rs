//! Flight submission handler.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::Extension, Json};
use grid_cache::TrajectoryTable;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::state::AppState;

/// Request body of `POST /submit_flight/`.
///
/// `data` accepts either column orient (`{"col": [..]}`) or
/// index orient (`{"col": {"0": .., "1": ..}}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightRequest {
    pub data: TrajectoryTable,
}

/// POST /submit_flight/ - Interpolate cached fields along a trajectory
///
/// Responds with the submitted table plus one column per configured field.
#[instrument(skip_all, fields(rows = request.data.len()))]
pub async fn submit_flight_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<FlightRequest>,
) -> Result<Json<TrajectoryTable>, ApiError> {
    let start = Instant::now();
    metrics::counter!("trajectory_api_requests_total").increment(1);

    let result = state.engine.interpolate(&request.data).await;

    metrics::histogram!("trajectory_api_request_duration_seconds")
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(table) => {
            info!(
                rows = table.len(),
                columns = table.column_names().count(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Flight interpolated"
            );
            Ok(Json(table))
        }
        Err(e) => {
            metrics::counter!("trajectory_api_request_errors_total").increment(1);
            Err(e.into())
        }
    }
}
