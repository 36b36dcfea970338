//! API error taxonomy and its HTTP mapping.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::schedule::ScheduleError;

/// Whether 500 bodies carry full error detail. Off outside development.
static DEV_ERRORS: AtomicBool = AtomicBool::new(false);

pub fn set_dev_errors(enabled: bool) {
    DEV_ERRORS.store(enabled, Ordering::Relaxed);
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request input, reported verbatim.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Concurrent modification of a versioned record.
    #[error("{0}")]
    Conflict(String),

    /// External dependency failure; detail redacted unless in dev mode.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::Validation(msg) => ApiError::Validation(msg),
            ScheduleError::NotFound(id) => ApiError::NotFound(format!("schedule {} not found", id)),
            ScheduleError::Conflict(id) => {
                ApiError::Conflict(format!("schedule {} was modified concurrently", id))
            }
            ScheduleError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Internal(e) => {
                tracing::error!(error = %format!("{:#}", e), "internal error serving request");
                let msg = if DEV_ERRORS.load(Ordering::Relaxed) {
                    format!("{:#}", e)
                } else {
                    "internal error".to_string()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(json!({ "error": { "message": message } }))).into_response()
    }
}
