//! The minimal object-store capability set the trash coordinator relies on.
//!
//! Implementations decide how bytes travel; the coordinator only needs to
//! inspect, copy, delete and list keys inside one bucket at a time.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::object::Object;

/// Metadata the store reports for a single key.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: i64,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl ObjectMeta {
    /// True when both sides describe the same payload.
    pub fn same_content(&self, other: &ObjectMeta) -> bool {
        self.size_bytes == other.size_bytes && self.etag == other.etag
    }
}

impl From<Object> for ObjectMeta {
    fn from(obj: Object) -> Self {
        Self {
            key: obj.key,
            size_bytes: obj.size_bytes,
            etag: obj.etag,
            last_modified: obj.last_modified,
        }
    }
}

/// One page of a prefix listing, in key order.
#[derive(Debug, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectMeta>,
    pub next_token: Option<String>,
}

/// What `copy_object` does when the destination key is already live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyMode {
    Overwrite,
    IfAbsent,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectMeta>;

    /// Server-side copy. With `CopyMode::IfAbsent` an occupied `dst` fails
    /// with `StoreError::AlreadyExists` and nothing is written.
    async fn copy_object(
        &self,
        bucket: &str,
        src: &str,
        dst: &str,
        mode: CopyMode,
    ) -> StoreResult<ObjectMeta>;

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;

    /// List keys starting with `prefix`. Pass the previous page's
    /// `next_token` to continue.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StoreResult<ObjectPage>;
}
