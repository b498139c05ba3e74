//! Typed error taxonomy shared by all components.
//!
//! Every error that crosses a component boundary carries one of the wire
//! kinds surfaced in JSON-RPC `error.code`. Transient dependency failures
//! are retried inside the pipeline; everything else propagates to the
//! caller unchanged.

use thiserror::Error;

/// Service-wide error type. The variant determines the wire `error.code`
/// string and the retry policy.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed tool input (unknown fields, wrong types, missing args).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Path Guard refused a path.
    #[error("path rejected: {0}")]
    PathRejected(String),

    /// Unknown folderId / file / chunk.
    #[error("not found: {0}")]
    NotFound(String),

    /// Folder already registered, or nested under / above an existing one.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Embedding provider or store failed temporarily (timeout, 5xx, 429).
    #[error("transient dependency failure: {0}")]
    TransientDependency(String),

    /// Provider/store rejected the request permanently (4xx other than 429).
    #[error("permanent dependency failure: {0}")]
    PermanentDependency(String),

    /// Watch descriptors exhausted, or a bounded queue was full on a
    /// non-blocking submit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wire string for JSON-RPC `error.code`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::PathRejected(_) => "path_rejected",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::TransientDependency(_) => "transient_dependency",
            Error::PermanentDependency(_) => "permanent_dependency",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the pipeline should retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientDependency(_))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("io: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidArgument(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
