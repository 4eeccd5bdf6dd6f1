//! Storage error taxonomy and its mapping onto HTTP responses.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::io::{self, ErrorKind};

/// Failure classes shared by every core storage operation.
#[derive(Debug)]
pub enum StoreError {
    /// Traversal or malformed input, rejected before touching disk.
    InvalidPath,
    NotFound,
    AlreadyExists,
    QuotaExceeded { required: u64, available: u64 },
    /// Move target is the source itself or one of its descendants.
    InvalidDestination,
    Io(io::Error),
    Database(sqlx::Error),
}

impl StoreError {
    /// Classifies an I/O error raised by an atomic primitive: collisions and
    /// missing sources become first-class outcomes, the rest stays opaque.
    pub fn classify(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::AlreadyExists => StoreError::AlreadyExists,
            ErrorKind::NotFound => StoreError::NotFound,
            _ => StoreError::Io(err),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidPath => write!(f, "invalid path"),
            StoreError::NotFound => write!(f, "item not found"),
            StoreError::AlreadyExists => write!(f, "destination already exists"),
            StoreError::QuotaExceeded {
                required,
                available,
            } => write!(
                f,
                "storage quota exceeded: {required} bytes required, {available} available"
            ),
            StoreError::InvalidDestination => {
                write!(f, "cannot move a folder into itself or its subfolder")
            }
            StoreError::Io(err) => write!(f, "io failure: {err}"),
            StoreError::Database(err) => write!(f, "metadata store failure: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err),
            StoreError::Database(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err)
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Unauthorized(HeaderMap),
    Forbidden(String),
    Conflict(String),
    InsufficientStorage(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::Unauthorized(headers) => {
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::InsufficientStorage(msg) => {
                (StatusCode::INSUFFICIENT_STORAGE, msg).into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StoreError::NotFound => ApiError::NotFound(error.to_string()),
            StoreError::AlreadyExists | StoreError::InvalidDestination => {
                ApiError::Conflict(error.to_string())
            }
            StoreError::QuotaExceeded { .. } => ApiError::InsufficientStorage(error.to_string()),
            StoreError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
            StoreError::Database(err) => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_promotes_collisions_and_missing_sources() {
        let exists = io::Error::new(ErrorKind::AlreadyExists, "taken");
        assert!(matches!(
            StoreError::classify(exists),
            StoreError::AlreadyExists
        ));
        let missing = io::Error::new(ErrorKind::NotFound, "gone");
        assert!(matches!(StoreError::classify(missing), StoreError::NotFound));
        let denied = io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert!(matches!(StoreError::classify(denied), StoreError::Io(_)));
    }

    #[test]
    fn quota_maps_to_insufficient_storage() {
        let response = ApiError::from(StoreError::QuotaExceeded {
            required: 10,
            available: 2,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[test]
    fn invalid_destination_maps_to_conflict() {
        let response = ApiError::from(StoreError::InvalidDestination).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
