//! `ObjectStore` over the SQLite + disk `StorageService`.

use async_trait::async_trait;
use std::io::ErrorKind;

use super::{CopyMode, ObjectMeta, ObjectPage, ObjectStore, StoreError, StoreResult};
use crate::services::storage_service::{ListObjectsParams, StorageError, StorageService};

const LIST_PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct LocalObjectStore {
    service: StorageService,
}

impl LocalObjectStore {
    pub fn new(service: StorageService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &StorageService {
        &self.service
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound { bucket, key } => {
                StoreError::NotFound(format!("{}/{}", bucket, key))
            }
            StorageError::BucketNotFound(bucket) => StoreError::NotFound(bucket),
            StorageError::ObjectAlreadyExists { bucket, key } => {
                StoreError::AlreadyExists(format!("{}/{}", bucket, key))
            }
            StorageError::Io(io) if io.kind() == ErrorKind::PermissionDenied => {
                StoreError::PermissionDenied(io.to_string())
            }
            StorageError::Io(io)
                if matches!(
                    io.kind(),
                    ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock
                ) =>
            {
                StoreError::Transient(io.to_string())
            }
            StorageError::Sqlx(
                err @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)),
            ) => StoreError::Transient(err.to_string()),
            other => StoreError::Other(other.to_string()),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectMeta> {
        let obj = self.service.get_object_metadata(bucket, key).await?;
        Ok(obj.into())
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src: &str,
        dst: &str,
        mode: CopyMode,
    ) -> StoreResult<ObjectMeta> {
        let obj = self.service.copy_object(bucket, src, dst, mode).await?;
        Ok(obj.into())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.service.delete_object(bucket, key).await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StoreResult<ObjectPage> {
        let result = self
            .service
            .list_objects_v2(
                bucket,
                ListObjectsParams {
                    prefix: Some(prefix.to_string()),
                    delimiter: None,
                    continuation_token,
                    start_after: None,
                    max_keys: LIST_PAGE_SIZE,
                },
            )
            .await?;

        Ok(ObjectPage {
            objects: result.objects.into_iter().map(ObjectMeta::from).collect(),
            next_token: result.next_continuation_token,
        })
    }
}
