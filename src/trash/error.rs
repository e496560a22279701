use thiserror::Error;

use crate::models::trash::TrashEntry;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum TrashError {
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    #[error("permission denied on `{key}`: {reason}")]
    PermissionDenied { key: String, reason: String },
    #[error("transient failure on `{key}`: {reason}")]
    TransientNetworkError { key: String, reason: String },
    /// The copy landed but the follow-up delete did not. Nothing was lost;
    /// `entry` describes the trash object as it now exists.
    #[error("{operation} of `{}` only partially applied: {source}", .entry.original_key)]
    PartialFailure {
        operation: &'static str,
        entry: Box<TrashEntry>,
        #[source]
        source: Box<TrashError>,
    },
    #[error("copy of `{src}` at `{dst}` does not match the source")]
    IntegrityMismatch { src: String, dst: String },
    #[error("`{0}` is not a valid object key")]
    InvalidKey(String),
    #[error("`{0}` is not a trash key")]
    InvalidTrashKey(String),
    #[error("`{0}` lies inside the trash namespace")]
    ReservedKey(String),
    #[error("operation on `{0}` cancelled")]
    Cancelled(String),
    #[error("store failure on `{key}`: {reason}")]
    Store { key: String, reason: String },
}

pub type TrashResult<T> = Result<T, TrashError>;

impl TrashError {
    /// Attach the key the failed store call was about.
    pub fn from_store(err: StoreError, key: &str) -> Self {
        match err {
            StoreError::NotFound(_) => TrashError::NotFound(key.to_string()),
            StoreError::AlreadyExists(_) => TrashError::AlreadyExists(key.to_string()),
            StoreError::PermissionDenied(reason) => TrashError::PermissionDenied {
                key: key.to_string(),
                reason,
            },
            StoreError::Transient(reason) => TrashError::TransientNetworkError {
                key: key.to_string(),
                reason,
            },
            StoreError::Other(reason) => TrashError::Store {
                key: key.to_string(),
                reason,
            },
        }
    }

    /// Whether the caller may simply try the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrashError::TransientNetworkError { .. }
                | TrashError::PartialFailure { .. }
                | TrashError::Cancelled(_)
        )
    }

    /// Short machine-readable name, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            TrashError::NotFound(_) => "not_found",
            TrashError::AlreadyExists(_) => "already_exists",
            TrashError::PermissionDenied { .. } => "permission_denied",
            TrashError::TransientNetworkError { .. } => "transient_network_error",
            TrashError::PartialFailure { .. } => "partial_failure",
            TrashError::IntegrityMismatch { .. } => "integrity_mismatch",
            TrashError::InvalidKey(_) => "invalid_key",
            TrashError::InvalidTrashKey(_) => "invalid_trash_key",
            TrashError::ReservedKey(_) => "reserved_key",
            TrashError::Cancelled(_) => "cancelled",
            TrashError::Store { .. } => "store",
        }
    }
}
