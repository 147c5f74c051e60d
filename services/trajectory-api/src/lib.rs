//! Trajectory API library
//!
//! Serves `POST /submit_flight/`: the submitted trajectory comes back with
//! one extra column per cached field, interpolated at every point.

pub mod client;
pub mod error;
pub mod handlers;
pub mod state;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

pub use client::{ClientError, TrajectoryClient};
pub use error::ApiError;
pub use state::AppState;

/// Largest accepted request body. Long flights exceed axum's 2 MB default.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the service router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/submit_flight/",
            post(handlers::flight::submit_flight_handler),
        )
        .route(
            "/submit_flight",
            post(handlers::flight::submit_flight_handler),
        )
        // Health and metrics
        .route("/health", get(handlers::health::health_handler))
        .route("/ready", get(handlers::health::ready_handler))
        .route("/metrics", get(handlers::health::metrics_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}
