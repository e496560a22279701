//! In-process `ObjectStore` with scripted faults.
//!
//! Useful for embedding the coordinator without a backing service and for
//! exercising failure paths: a fault fires once, on the first matching call.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{CopyMode, ObjectMeta, ObjectPage, ObjectStore, StoreError, StoreResult};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Head,
    Copy,
    Delete,
    List,
}

/// What a matching call does instead of its normal work.
#[derive(Clone, Debug)]
pub enum FaultAction {
    /// Return this error and change nothing.
    Fail(StoreError),
    /// Copy only: write a truncated payload under the destination key.
    Corrupt,
}

#[derive(Clone, Debug)]
struct Fault {
    op: StoreOp,
    key_prefix: String,
    action: FaultAction,
}

#[derive(Clone, Debug)]
struct StoredObject {
    body: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn new(body: Bytes) -> Self {
        let etag = format!("{:x}", md5::compute(&body));
        Self {
            body,
            etag,
            last_modified: Utc::now(),
        }
    }

    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size_bytes: self.body.len() as i64,
            etag: Some(self.etag.clone()),
            last_modified: self.last_modified,
        }
    }
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    faults: Vec<Fault>,
    calls: HashMap<StoreOp, usize>,
}

impl State {
    /// Count the call and pop the first fault matching it.
    fn take_fault(&mut self, op: StoreOp, key: &str) -> Option<FaultAction> {
        *self.calls.entry(op).or_default() += 1;
        let idx = self
            .faults
            .iter()
            .position(|f| f.op == op && key.starts_with(&f.key_prefix))?;
        Some(self.faults.remove(idx).action)
    }

    fn bucket(&mut self, bucket: &str) -> StoreResult<&mut BTreeMap<String, StoredObject>> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NotFound(bucket.to_string()))
    }
}

pub struct MemoryObjectStore {
    state: Mutex<State>,
    page_size: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Limit listing pages to `page_size` keys.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.state().buckets.entry(bucket.to_string()).or_default();
    }

    /// Store `body` under `key`, creating the bucket if needed.
    pub fn put_object(&self, bucket: &str, key: &str, body: impl Into<Bytes>) -> ObjectMeta {
        let stored = StoredObject::new(body.into());
        let meta = stored.meta(key);
        self.state()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), stored);
        meta
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.body.clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.get_object(bucket, key).is_some()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Arm a one-shot fault for the first `op` call whose key starts with
    /// `key_prefix`.
    pub fn inject(&self, op: StoreOp, key_prefix: &str, action: FaultAction) {
        self.state().faults.push(Fault {
            op,
            key_prefix: key_prefix.to_string(),
            action,
        });
    }

    pub fn fail_next(&self, op: StoreOp, key_prefix: &str, err: StoreError) {
        self.inject(op, key_prefix, FaultAction::Fail(err));
    }

    /// Number of `op` calls seen so far, faulted ones included.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectMeta> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if let Some(FaultAction::Fail(err)) = state.take_fault(StoreOp::Head, key) {
            return Err(err);
        }
        state
            .bucket(bucket)?
            .get(key)
            .map(|o| o.meta(key))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src: &str,
        dst: &str,
        mode: CopyMode,
    ) -> StoreResult<ObjectMeta> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let fault = state.take_fault(StoreOp::Copy, dst);
        if let Some(FaultAction::Fail(err)) = fault {
            return Err(err);
        }
        let objects = state.bucket(bucket)?;
        let source = objects
            .get(src)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(src.to_string()))?;
        if mode == CopyMode::IfAbsent && objects.contains_key(dst) {
            return Err(StoreError::AlreadyExists(dst.to_string()));
        }

        let copy = match fault {
            Some(FaultAction::Corrupt) => {
                let half = source.body.len() / 2;
                StoredObject::new(source.body.slice(..half))
            }
            _ => StoredObject {
                last_modified: Utc::now(),
                ..source
            },
        };
        let meta = copy.meta(dst);
        objects.insert(dst.to_string(), copy);
        Ok(meta)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if let Some(FaultAction::Fail(err)) = state.take_fault(StoreOp::Delete, key) {
            return Err(err);
        }
        state
            .bucket(bucket)?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StoreResult<ObjectPage> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if let Some(FaultAction::Fail(err)) = state.take_fault(StoreOp::List, prefix) {
            return Err(err);
        }
        let page_size = self.page_size;
        let objects = state.bucket(bucket)?;

        let mut matching = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| match &continuation_token {
                Some(token) => key.as_str() > token.as_str(),
                None => true,
            })
            .map(|(key, obj)| obj.meta(key))
            .take(page_size + 1)
            .collect::<Vec<_>>();

        let next_token = if matching.len() > page_size {
            matching.truncate(page_size);
            matching.last().map(|m| m.key.clone())
        } else {
            None
        };

        Ok(ObjectPage {
            objects: matching,
            next_token,
        })
    }
}
