use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::sync::RunError;

/// Body of every JSON error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub message: String,
    pub code: String,
    /// Filled in by the request id middleware.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Run(RunError),
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        ApiError::Run(err)
    }
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, String, String) {
        match self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_input".into(),
                msg,
            ),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "not_found",
                "not_found".into(),
                msg,
            ),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_error".into(),
                    "An internal error occurred".into(),
                )
            }
            ApiError::Run(err) => {
                let message = err.to_string();
                match err {
                    RunError::InvalidInput(msg) => (
                        StatusCode::BAD_REQUEST,
                        "invalid_request_error",
                        "invalid_input".into(),
                        msg,
                    ),
                    RunError::AlreadyRunning(_) => (
                        StatusCode::CONFLICT,
                        "conflict",
                        "already_running".into(),
                        message,
                    ),
                    RunError::Query(_) => (
                        StatusCode::BAD_GATEWAY,
                        "upstream_error",
                        "billing_query_failed".into(),
                        message,
                    ),
                    RunError::Sync(e) => (
                        StatusCode::BAD_GATEWAY,
                        "upstream_error",
                        format!("sheets_{}", e.kind()),
                        message,
                    ),
                    RunError::Aggregation(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        "aggregation_failed".into(),
                        message,
                    ),
                    RunError::DeadlineExceeded(_) => (
                        StatusCode::GATEWAY_TIMEOUT,
                        "timeout",
                        "deadline_exceeded".into(),
                        message,
                    ),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = self.parts();
        let body = ErrorResponse {
            error: ErrorInfo {
                error_type,
                message,
                code,
                request_id: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
