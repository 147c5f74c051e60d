//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use grid_cache::GridCacheError;
use serde::{Deserialize, Serialize};

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub retryable: bool,
}

/// Error returned by request handlers.
#[derive(Debug)]
pub struct ApiError(pub GridCacheError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GridCacheError::InvalidTrajectory(_) => StatusCode::BAD_REQUEST,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GridCacheError> for ApiError {
    fn from(err: GridCacheError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self.0 {
            GridCacheError::ConfigMismatch(_) | GridCacheError::InvalidConfig(_) => {
                format!("server configuration error: {}", self.0)
            }
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, status = status.as_u16(), "Request failed");
        } else {
            tracing::warn!(error = %self.0, status = status.as_u16(), "Rejected request");
        }

        let body = ErrorBody {
            error,
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (GridCacheError::invalid_trajectory("no altitude"), StatusCode::BAD_REQUEST),
            (GridCacheError::config_mismatch("levels"), StatusCode::INTERNAL_SERVER_ERROR),
            (GridCacheError::invalid_config("chunk"), StatusCode::INTERNAL_SERVER_ERROR),
            (GridCacheError::remote_unavailable("reset"), StatusCode::SERVICE_UNAVAILABLE),
            (
                GridCacheError::RemoteTimeout(Duration::from_secs(1)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (GridCacheError::storage_error("disk"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
