//! Response envelope and error bodies
//!
//! Every success is `{status: "ok", message, result}`; every failure is
//! `{status: "failed", code, message, timestamp, path}`. No partial 2xx
//! responses exist anywhere on the surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use mnemo_core::EngineError;

/// Build the success envelope
pub fn ok<T: Serialize>(message: impl Into<String>, result: T) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": message.into(),
        "result": result,
    }))
}

// ============================================================================
// API ERROR
// ============================================================================

/// One failed request, ready to render
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status
    pub status: StatusCode,
    /// Machine-readable code
    pub code: &'static str,
    /// Human-readable message
    pub message: String,
    /// Request path echoed in the body
    pub path: String,
}

impl ApiError {
    /// 400 with `INVALID_PARAMETER`
    pub fn invalid(path: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_PARAMETER",
            message: message.into(),
            path: path.to_string(),
        }
    }

    /// 400 with `VALIDATION_FAILED`
    pub fn validation(path: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_FAILED",
            message: message.into(),
            path: path.to_string(),
        }
    }

    /// 404 with `RESOURCE_NOT_FOUND`
    pub fn not_found(path: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "RESOURCE_NOT_FOUND",
            message: message.into(),
            path: path.to_string(),
        }
    }

    /// 500 with `SYSTEM_ERROR`
    pub fn system(path: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "SYSTEM_ERROR",
            message: message.into(),
            path: path.to_string(),
        }
    }

    /// Map an engine error onto the HTTP taxonomy
    pub fn from_engine(path: &str, error: EngineError) -> Self {
        match error {
            EngineError::InvalidArgument(message) => Self::invalid(path, message),
            EngineError::ValidationFailed(message) => Self::validation(path, message),
            EngineError::NotFound(message) => Self::not_found(path, message),
            other => {
                tracing::error!("Request to {path} failed: {other}");
                Self::system(path, other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "status": "failed",
            "code": self.code,
            "message": self.message,
            "timestamp": Utc::now().to_rfc3339(),
            "path": self.path,
        }));
        (self.status, body).into_response()
    }
}

// ============================================================================
// TESTS
// ============================================================================
