use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain failures raised by measurement, materialization and the pipeline
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// Too few points or non-finite coordinates
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// `dpi` or `scale` absent or not positive; unit conversion is undefined
    #[error("calibration missing: {0}")]
    CalibrationMissing(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A record failed field validation; the whole batch is rejected
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Verification gate: lists every missing annotation family
    #[error("missing annotations: {}", .0.join(", "))]
    MissingAnnotations(Vec<String>),

    #[error("detection failed: {0}")]
    Detection(String),

    #[error("store error: {0}")]
    Store(String),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Failures worth another attempt from the stage queue
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Detection(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// HTTP-facing error. Wraps domain errors and adds request-level failures.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Pipeline(err) => {
                let (status, code) = match err {
                    PipelineError::InvalidGeometry(_) => (StatusCode::BAD_REQUEST, "INVALID_GEOMETRY"),
                    PipelineError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                    PipelineError::MissingAnnotations(_) => {
                        (StatusCode::BAD_REQUEST, "ANNOTATIONS_MISSING")
                    }
                    PipelineError::CalibrationMissing(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "CALIBRATION_MISSING")
                    }
                    PipelineError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "PERMISSION_DENIED"),
                    PipelineError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                    PipelineError::Detection(_) => (StatusCode::BAD_GATEWAY, "DETECTION_FAILED"),
                    PipelineError::Store(msg) => {
                        tracing::error!(error = %msg, "Store error");
                        (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
                    }
                };
                (status, code, err.to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}
