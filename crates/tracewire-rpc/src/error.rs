//! Error types for RPC calls.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracewire_tracing::Reportable;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors that can occur crossing an RPC boundary.
///
/// Serializable, so a failure raised inside an object reaches the caller
/// with its name and message intact.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RpcError {
    /// The remote handler failed.
    #[error("{message}")]
    Remote { name: String, message: String },

    /// The object has no such method.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Arguments or result could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The object stopped before answering.
    #[error("Object unavailable: {0}")]
    Unavailable(String),
}

impl RpcError {
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Remote {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Carry a handler failure across the boundary by name and message.
    pub fn from_reportable<E: Reportable + ?Sized>(error: &E) -> Self {
        Self::remote(error.error_name(), error.to_string())
    }
}

impl Reportable for RpcError {
    fn error_name(&self) -> Cow<'_, str> {
        match self {
            RpcError::Remote { name, .. } => Cow::Borrowed(name),
            RpcError::UnknownMethod(_) => Cow::Borrowed("UnknownMethod"),
            RpcError::Serialization(_) => Cow::Borrowed("SerializationError"),
            RpcError::Unavailable(_) => Cow::Borrowed("ObjectUnavailable"),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::remote("ChildEffectError", "Intentional error");
        assert_eq!(err.to_string(), "Intentional error");
        assert_eq!(err.error_name(), "ChildEffectError");

        let err = RpcError::UnknownMethod("nope".to_string());
        assert_eq!(err.to_string(), "Unknown method: nope");
    }

    #[test]
    fn test_remote_error_survives_serialization() {
        let err = RpcError::remote("ChildEffectError", "boom");
        let json = serde_json::to_string(&err).unwrap();
        let back: RpcError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
