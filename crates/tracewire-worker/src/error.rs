//! Error types for the demo worker.

use std::borrow::Cow;
use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracewire_rpc::RpcError;
use tracewire_tracing::Reportable;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// A named failure raised by a demo program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProgramError {
    pub name: String,
    pub message: String,
}

impl ProgramError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Reportable for ProgramError {
    fn error_name(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.name)
    }
}

/// Errors surfaced by API handlers.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// A program run by the handler failed.
    #[error(transparent)]
    Program(#[from] ProgramError),

    /// A Durable Object call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl Reportable for WorkerError {
    fn error_name(&self) -> Cow<'_, str> {
        match self {
            WorkerError::Program(e) => e.error_name(),
            WorkerError::Rpc(e) => e.error_name(),
        }
    }
}

/// A handler error attached to its response for the capture middleware.
#[derive(Debug, Clone)]
pub struct CapturedError(pub Arc<WorkerError>);

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            WorkerError::Program(_) => (StatusCode::INTERNAL_SERVER_ERROR, "program_error"),
            WorkerError::Rpc(RpcError::Remote { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "remote_error")
            }
            WorkerError::Rpc(RpcError::UnknownMethod(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "unknown_method")
            }
            WorkerError::Rpc(RpcError::Serialization(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error")
            }
            WorkerError::Rpc(RpcError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
        };

        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "name": self.error_name(),
                "message": self.to_string()
            }
        });

        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(CapturedError(Arc::new(self)));
        response
    }
}
