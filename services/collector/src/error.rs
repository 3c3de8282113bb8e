//! Central error types for the collector
//!
//! `FeedError` is the pipeline taxonomy: everything that can go wrong
//! between a raw frame and a sink write. Containment is decided at the
//! connector's dispatch boundary via [`FeedError::is_contained`]:
//! malformed payloads, schema failures, and sink write failures keep the
//! stream alive; transport loss reaches the reconnect loop; cancellation
//! ends the task.
//!
//! `AppError` is the HTTP envelope for the control plane.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::schema::SchemaError;
use crate::signing::SigningError;
use crate::sink::SinkError;
use crate::transport::TransportError;

/// Errors flowing through the ingestion pipeline.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("sink ingestion failed: {0}")]
    Ingestion(#[from] SinkError),

    #[error("session token signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("transport closed: {0}")]
    Transport(#[from] TransportError),

    #[error("subscription cancelled")]
    Cancelled,
}

impl FeedError {
    /// True when the dispatch loop should log the error and keep streaming.
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            FeedError::Malformed(_) | FeedError::Schema(_) | FeedError::Ingestion(_)
        )
    }
}

/// Central error type for the control plane
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code) = match self {
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, "CONFLICT"),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND"),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            AppError::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "INTERNAL_ERROR",
            ),
        };

        let body = Json(json!({
            "error": code,
            "message": error_message
        }));

        (status, body).into_response()
    }
}
