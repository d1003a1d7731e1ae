//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use pullcache_core::error::CoreError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error, matching the error kinds of the coordination engine.
#[derive(Debug, Display)]
pub enum ServerError {
    /// The requested artifact does not exist.
    NotFound,

    /// The write was a duplicate of existing content; treated as success.
    AlreadyExists,

    /// The NAR was already migrated to chunked storage.
    AlreadyChunked,

    /// The database is in an inconsistent state: {0}
    InconsistentState(AnyError),

    /// Could not acquire the lock after exhausting retries.
    LockUnavailable,

    /// No healthy upstream had the requested artifact.
    UpstreamUnavailable,

    /// Upstream signature verification failed.
    SignatureVerificationFailed,

    /// The request was canceled.
    Canceled,

    /// I/O error: {0}
    Io(AnyError),

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// Manifest serialization error: {0}
    ManifestSerializationError(super::nix_manifest::Error),

    /// General request error: {0}
    RequestError(AnyError),

    /// Error from the common components: {0}
    CoreError(CoreError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    pub fn io_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::Io(AnyError::new(error))
    }

    pub fn inconsistent_state(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::InconsistentState(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::AlreadyChunked => "AlreadyChunked",
            Self::InconsistentState(_) => "InconsistentState",
            Self::LockUnavailable => "LockUnavailable",
            Self::UpstreamUnavailable => "UpstreamUnavailable",
            Self::SignatureVerificationFailed => "SignatureVerificationFailed",
            Self::Canceled => "Canceled",
            Self::Io(_) => "IO",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::ManifestSerializationError(_) => "ManifestSerializationError",
            Self::RequestError(_) => "RequestError",
            Self::CoreError(e) => e.name(),
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AlreadyExists => StatusCode::OK,
            Self::AlreadyChunked => StatusCode::OK,
            Self::SignatureVerificationFailed => StatusCode::BAD_GATEWAY,
            Self::LockUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            Self::ManifestSerializationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl From<CoreError> for ServerError {
    fn from(error: CoreError) -> Self {
        Self::CoreError(error)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(error: std::io::Error) -> Self {
        Self::io_error(error)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::DatabaseError(_)
                | Self::StorageError(_)
                | Self::ManifestSerializationError(_)
                | Self::InconsistentState(_)
                | Self::CoreError(_)
        ) {
            tracing::error!("{:?}", self);
        }

        let status_code = self.http_status_code();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: self.to_string(),
            error: self.name().to_string(),
        };

        (status_code, Json(error_response)).into_response()
    }
}
