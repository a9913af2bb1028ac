use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::dialect::DialectError;
use crate::services::resolver::ResolveError;

/// Application error taxonomy.
///
/// Everything here describes a failure *before* any result bytes were
/// written; failures after streaming has begun terminate the connection
/// in-band and never pass through this type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Query could not be meaningfully parsed or classified. Never retried.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Referenced datasets share no backend. Never retried by design.
    #[error("Incompatible datasets: {0}")]
    Incompatibility(String),

    /// Admission control rejected the query before execution.
    #[error("Projected result of {estimated_rows} rows exceeds the {threshold} row limit")]
    SizeExceeded {
        estimated_rows: i64,
        threshold: i64,
        provenance: String,
    },

    /// All candidates exhausted, or a sole backend failed.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_detail) = match self {
            AppError::Analysis(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("ANALYSIS_ERROR", msg),
            ),
            AppError::Incompatibility(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("INCOMPATIBLE_DATASETS", msg),
            ),
            AppError::SizeExceeded {
                estimated_rows,
                threshold,
                provenance,
            } => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new(
                    "SIZE_EXCEEDED",
                    format!(
                        "Projected result of {} rows exceeds the {} row limit. \
                         Narrow the requested time or space ranges and try again.",
                        estimated_rows, threshold
                    ),
                )
                .with_details(format!("estimate provenance: {}", provenance)),
            ),
            AppError::Backend(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("BACKEND_ERROR", msg),
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("VALIDATION_ERROR", msg),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorDetail::new("NOT_FOUND", msg)),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("INTERNAL_ERROR", msg),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NoRealTables => AppError::Analysis(err.to_string()),
            ResolveError::NotColocated { .. } => AppError::Incompatibility(err.to_string()),
        }
    }
}

impl From<DialectError> for AppError {
    fn from(err: DialectError) -> Self {
        AppError::Analysis(err.to_string())
    }
}
