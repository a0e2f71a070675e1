use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use easel_core::{GenerateError, LoadError, TrainingError};

/// Everything a handler can fail with, mapped onto the wire as
/// `{"error": {"code", "message"}}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Generate(GenerateError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            ApiError::Generate(GenerateError::ModelUnavailable(LoadError::NotFound(_))) => {
                (StatusCode::NOT_FOUND, "model_not_found")
            }
            ApiError::Generate(GenerateError::ModelUnavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "model_unavailable")
            }
            ApiError::Generate(GenerateError::Inference { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "generation_failed")
            }
            ApiError::Generate(GenerateError::Timeout(_)) => {
                (StatusCode::REQUEST_TIMEOUT, "generation_timeout")
            }
            ApiError::Training(
                TrainingError::InvalidSpec(_)
                | TrainingError::InvalidUpload(_)
                | TrainingError::StorageLimit(_),
            ) => (StatusCode::BAD_REQUEST, "invalid_training_request"),
            ApiError::Training(TrainingError::JobNotFound(_)) => {
                (StatusCode::NOT_FOUND, "training_job_not_found")
            }
            ApiError::Training(TrainingError::AlreadyRunning { .. }) => {
                (StatusCode::CONFLICT, "training_already_running")
            }
            ApiError::Training(TrainingError::Unconfigured) => {
                (StatusCode::SERVICE_UNAVAILABLE, "training_unavailable")
            }
            ApiError::Training(_) => (StatusCode::INTERNAL_SERVER_ERROR, "training_failed"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(code, error = ?self, "request failed");
        } else {
            warn!(code, error = %self, "request rejected");
        }
        let body = Json(json!({
            "error": { "code": code, "message": self.to_string() }
        }));
        (status, body).into_response()
    }
}
