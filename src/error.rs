//! Typed error taxonomy shared by the engine and the sidecar.
//!
//! The engine surfaces one of these variants; the sidecar maps it to the
//! HTTP status and `error_code` of the response envelope. Warnings
//! (duplicate anchors, encoding fallbacks, holes) are *not* errors — they
//! travel inside successful responses.

use thiserror::Error;

/// Engine-level error. `Validation` and `NotFound` carry messages meant for
/// the caller; everything else collapses into `Internal`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: bad parameter, unknown enumerant, invalid regex,
    /// out-of-range number, or a referenced identity that does not exist
    /// when used as request input.
    #[error("{0}")]
    Validation(String),

    /// A resource addressed by id (link, job, run) does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Storage-layer failure.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other uncaught failure (parser, serializer, worker).
    #[error("{0}")]
    Internal(String),

    /// A cooperative checkpoint observed the cancel flag. The job runtime
    /// maps this to `status=canceled`; it is not an error to callers.
    #[error("operation canceled")]
    Canceled,
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }

    /// Machine-readable code used in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Canceled => "CANCELED",
            EngineError::Db(_) | EngineError::Io(_) | EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Error family name for the envelope's `error.type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Canceled => "canceled",
            EngineError::Db(_) | EngineError::Io(_) | EngineError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization error: {}", e))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
