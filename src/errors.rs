use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::{services::storage_service::StorageError, trash::TrashError};

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Machine-readable error name, e.g. `already_exists`.
    pub kind: &'static str,
    /// Extra payload, such as the entry left behind by a partial failure.
    pub detail: Option<serde_json::Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            kind: "error",
            detail: None,
        }
    }

    pub fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg).with_kind("internal")
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg).with_kind("not_found")
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg).with_kind("bad_request")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16(),
            "kind": self.kind,
        });
        if let (Some(detail), Some(obj)) = (self.detail, body.as_object_mut()) {
            obj.insert("detail".into(), detail);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let (status, kind) = match &err {
            StorageError::BucketNotFound(_) | StorageError::ObjectNotFound { .. } => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            StorageError::BucketAlreadyExists(_) | StorageError::ObjectAlreadyExists { .. } => {
                (StatusCode::CONFLICT, "already_exists")
            }
            StorageError::InvalidBucketName { .. }
            | StorageError::UnsupportedRegion(_)
            | StorageError::InvalidObjectKey => (StatusCode::BAD_REQUEST, "invalid_request"),
            StorageError::Sqlx(_) | StorageError::Io(_) => {
                tracing::error!("storage failure: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError::new(status, err.to_string()).with_kind(kind)
    }
}

impl From<TrashError> for AppError {
    fn from(err: TrashError) -> Self {
        let status = match &err {
            TrashError::NotFound(_) => StatusCode::NOT_FOUND,
            TrashError::AlreadyExists(_) => StatusCode::CONFLICT,
            TrashError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            TrashError::TransientNetworkError { .. } | TrashError::Cancelled(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TrashError::PartialFailure { .. } => StatusCode::MULTI_STATUS,
            TrashError::IntegrityMismatch { .. } => StatusCode::BAD_GATEWAY,
            TrashError::InvalidKey(_)
            | TrashError::InvalidTrashKey(_)
            | TrashError::ReservedKey(_) => StatusCode::BAD_REQUEST,
            TrashError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let detail = match &err {
            TrashError::PartialFailure { entry, .. } => serde_json::to_value(entry).ok(),
            _ => None,
        };

        AppError {
            status,
            message: err.to_string(),
            kind: err.kind(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trash::TrashEntry;
    use chrono::Utc;

    #[test]
    fn partial_failure_carries_the_entry() {
        let entry = TrashEntry {
            original_key: "a.txt".into(),
            trash_key: ".xdrive-trash/a.txt/2024-01-01T00:00:00Z-ab12".into(),
            deleted_at: Utc::now(),
            size_bytes: 1,
            etag: None,
        };
        let err = AppError::from(TrashError::PartialFailure {
            operation: "soft delete",
            entry: Box::new(entry),
            source: Box::new(TrashError::Cancelled("a.txt".into())),
        });

        assert_eq!(err.status, StatusCode::MULTI_STATUS);
        assert_eq!(err.kind, "partial_failure");
        assert_eq!(
            err.detail.unwrap()["trash_key"],
            ".xdrive-trash/a.txt/2024-01-01T00:00:00Z-ab12"
        );
    }

    #[test]
    fn conflicts_map_to_409() {
        let err = AppError::from(TrashError::AlreadyExists("a.txt".into()));
        assert_eq!(err.status, StatusCode::CONFLICT);
        let err = AppError::from(StorageError::BucketAlreadyExists("photos".into()));
        assert_eq!(err.status, StatusCode::CONFLICT);
    }
}
