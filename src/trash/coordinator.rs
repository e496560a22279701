//! Reversible deletes over a store that has no trash of its own.
//!
//! Every relocation is copy, verify, then delete. A failure before the
//! delete leaves the source untouched; a failure of the delete itself leaves
//! both copies in place and is reported as `TrashError::PartialFailure`.
//! The store is the only source of truth: each operation re-reads the keys
//! it touches after taking their locks.

use chrono::{DateTime, TimeDelta, Utc};
use futures::{Stream, TryStreamExt, stream};
use std::{
    collections::HashMap,
    future::Future,
    pin::pin,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    clock::{Clock, SystemClock},
    context::TrashContext,
    error::{TrashError, TrashResult},
    layout::TrashLayout,
    locks::KeyLocks,
    report::BatchReport,
};
use crate::models::trash::{TrashEntry, TrashIndex};
use crate::store::{CopyMode, ObjectMeta, ObjectStore, StoreError};

const TOKEN_LEN: usize = 8;

/// Listing position of `list_trash_stream`.
enum Cursor {
    Start,
    Next(String),
    Done,
}

pub struct TrashCoordinator<S> {
    store: S,
    layout: TrashLayout,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
    snapshots: RwLock<HashMap<(String, String), TrashIndex>>,
}

impl<S: ObjectStore> TrashCoordinator<S> {
    pub fn new(store: S, layout: TrashLayout) -> Self {
        Self {
            store,
            layout,
            clock: Arc::new(SystemClock),
            locks: KeyLocks::new(),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn layout(&self) -> &TrashLayout {
        &self.layout
    }

    /// Move `key` into the trash and return the new entry.
    pub async fn soft_delete(&self, ctx: &TrashContext, key: &str) -> TrashResult<TrashEntry> {
        if key.is_empty() {
            return Err(TrashError::InvalidKey(key.to_string()));
        }
        if self.layout.is_reserved(key) {
            return Err(TrashError::ReservedKey(key.to_string()));
        }

        let _guard = self.locks.lock(&ctx.bucket, key).await;
        let source = self
            .call(ctx, key, self.store.head_object(&ctx.bucket, key))
            .await?;

        let deleted_at = self.deletion_time();
        let trash_key = self.layout.trash_key(key, deleted_at, &new_token());
        let copied = self.copy_verified(ctx, key, &trash_key, &source).await?;

        let entry = TrashEntry {
            original_key: key.to_string(),
            trash_key,
            deleted_at,
            size_bytes: copied.size_bytes,
            etag: copied.etag,
        };

        let deleted = self
            .call(ctx, key, self.store.delete_object(&ctx.bucket, key))
            .await;
        self.invalidate(ctx);
        match deleted {
            Ok(()) => {}
            Err(TrashError::NotFound(_)) => {
                debug!("{}/{} vanished before its delete; trash copy stands", ctx.bucket, key);
            }
            Err(err) => {
                warn!(
                    "soft delete of {}/{} left the original in place: {}",
                    ctx.bucket, key, err
                );
                return Err(TrashError::PartialFailure {
                    operation: "soft delete",
                    entry: Box::new(entry),
                    source: Box::new(err),
                });
            }
        }

        info!(
            "[{}] moved {}/{} to trash as {}",
            ctx.profile, ctx.bucket, key, entry.trash_key
        );
        Ok(entry)
    }

    /// Soft delete every live object under `prefix` ("folder delete").
    /// Objects are handled one by one; failures are reported per key.
    pub async fn soft_delete_prefix(
        &self,
        ctx: &TrashContext,
        prefix: &str,
    ) -> TrashResult<BatchReport> {
        if prefix.is_empty() {
            return Err(TrashError::InvalidKey(prefix.to_string()));
        }
        if self.layout.is_reserved(prefix) {
            return Err(TrashError::ReservedKey(prefix.to_string()));
        }

        let mut keys = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .call(
                    ctx,
                    prefix,
                    self.store.list_objects(&ctx.bucket, prefix, token.take()),
                )
                .await?;
            keys.extend(
                page.objects
                    .into_iter()
                    .map(|meta| meta.key)
                    .filter(|key| !self.layout.is_reserved(key)),
            );
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let mut report = BatchReport::default();
        for key in keys {
            let outcome = self.soft_delete(ctx, &key).await;
            report.record(&key, outcome);
        }

        info!(
            "[{}] folder delete of {}/{}: {} moved, {} failed",
            ctx.profile,
            ctx.bucket,
            prefix,
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Lazily page through the trash namespace, in store order.
    ///
    /// Nothing is fetched until the stream is polled, and calling this again
    /// starts over from the current store state. Keys that do not follow the
    /// trash layout are skipped.
    pub fn list_trash_stream<'a>(
        &'a self,
        ctx: &'a TrashContext,
    ) -> impl Stream<Item = TrashResult<TrashEntry>> + 'a {
        stream::try_unfold(Cursor::Start, move |cursor| self.trash_page(ctx, cursor))
            .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, TrashError>)))
            .try_flatten()
    }

    async fn trash_page(
        &self,
        ctx: &TrashContext,
        cursor: Cursor,
    ) -> TrashResult<Option<(Vec<TrashEntry>, Cursor)>> {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Done => return Ok(None),
        };

        let root = self.layout.root();
        let page = self
            .call(ctx, &root, self.store.list_objects(&ctx.bucket, &root, token))
            .await?;

        let entries = page
            .objects
            .iter()
            .filter_map(|meta| {
                let entry = self.layout.entry_from_meta(meta);
                if entry.is_none() {
                    warn!(
                        "skipping {}/{}: not a trash key",
                        ctx.bucket, meta.key
                    );
                }
                entry
            })
            .collect::<Vec<_>>();

        let next = match page.next_token {
            Some(token) => Cursor::Next(token),
            None => Cursor::Done,
        };
        Ok(Some((entries, next)))
    }

    /// Current trash contents, newest deletion first. The result also
    /// replaces the context's cached snapshot.
    pub async fn list_trash(&self, ctx: &TrashContext) -> TrashResult<TrashIndex> {
        let entries: Vec<TrashEntry> = self.list_trash_stream(ctx).try_collect().await?;
        let index = TrashIndex::new(&ctx.profile, &ctx.bucket, self.clock.now(), entries);
        debug!(
            "[{}] trash of {} holds {} entries",
            ctx.profile,
            ctx.bucket,
            index.len()
        );
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ctx.snapshot_key(), index.clone());
        Ok(index)
    }

    /// Last listing for this context, if still valid. Display only.
    pub fn cached_trash(&self, ctx: &TrashContext) -> Option<TrashIndex> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ctx.snapshot_key())
            .cloned()
    }

    /// Move a trashed object back to where it came from. Never overwrites a
    /// live object at the original key.
    pub async fn restore(&self, ctx: &TrashContext, trash_key: &str) -> TrashResult<TrashEntry> {
        let parsed = self
            .layout
            .parse(trash_key)
            .ok_or_else(|| TrashError::InvalidTrashKey(trash_key.to_string()))?;
        if self.layout.is_reserved(&parsed.original_key) {
            return Err(TrashError::ReservedKey(parsed.original_key));
        }

        let _guards = self
            .locks
            .lock_all(&ctx.bucket, &[trash_key, &parsed.original_key])
            .await;
        let trashed = self
            .call(ctx, trash_key, self.store.head_object(&ctx.bucket, trash_key))
            .await?;

        let entry = TrashEntry {
            original_key: parsed.original_key,
            trash_key: trash_key.to_string(),
            deleted_at: parsed.deleted_at,
            size_bytes: trashed.size_bytes,
            etag: trashed.etag.clone(),
        };

        self.copy_verified(ctx, trash_key, &entry.original_key, &trashed)
            .await?;

        let deleted = self
            .call(ctx, trash_key, self.store.delete_object(&ctx.bucket, trash_key))
            .await;
        self.invalidate(ctx);
        match deleted {
            Ok(()) | Err(TrashError::NotFound(_)) => {}
            Err(err) => {
                warn!(
                    "restore of {}/{} kept the trash copy {}: {}",
                    ctx.bucket, entry.original_key, trash_key, err
                );
                return Err(TrashError::PartialFailure {
                    operation: "restore",
                    entry: Box::new(entry),
                    source: Box::new(err),
                });
            }
        }

        info!(
            "[{}] restored {}/{} from {}",
            ctx.profile, ctx.bucket, entry.original_key, trash_key
        );
        Ok(entry)
    }

    /// Permanently delete one trashed object. Irreversible.
    pub async fn purge(&self, ctx: &TrashContext, trash_key: &str) -> TrashResult<TrashEntry> {
        let parsed = self
            .layout
            .parse(trash_key)
            .ok_or_else(|| TrashError::InvalidTrashKey(trash_key.to_string()))?;

        let _guard = self.locks.lock(&ctx.bucket, trash_key).await;
        let trashed = self
            .call(ctx, trash_key, self.store.head_object(&ctx.bucket, trash_key))
            .await?;
        self.call(ctx, trash_key, self.store.delete_object(&ctx.bucket, trash_key))
            .await?;
        self.invalidate(ctx);

        info!("[{}] purged {}/{}", ctx.profile, ctx.bucket, trash_key);
        Ok(TrashEntry {
            original_key: parsed.original_key,
            trash_key: trash_key.to_string(),
            deleted_at: parsed.deleted_at,
            size_bytes: trashed.size_bytes,
            etag: trashed.etag,
        })
    }

    /// Purge every entry deleted more than `age` ago.
    ///
    /// Each purge stands alone: one failure is recorded and the scan goes
    /// on. Fails outright only if the trash cannot be listed at all.
    pub async fn purge_older_than(
        &self,
        ctx: &TrashContext,
        age: Duration,
    ) -> TrashResult<BatchReport> {
        let now = self.clock.now();
        let Some(cutoff) = TimeDelta::from_std(age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            debug!("retention window {:?} reaches past the epoch; nothing to purge", age);
            return Ok(BatchReport::default());
        };

        info!(
            "[{}] purging trash of {} deleted before {}",
            ctx.profile, ctx.bucket, cutoff
        );
        self.purge_where(ctx, |entry| entry.deleted_at < cutoff).await
    }

    /// Purge everything in the trash.
    pub async fn empty_trash(&self, ctx: &TrashContext) -> TrashResult<BatchReport> {
        info!("[{}] emptying trash of {}", ctx.profile, ctx.bucket);
        self.purge_where(ctx, |_| true).await
    }

    async fn purge_where(
        &self,
        ctx: &TrashContext,
        mut selected: impl FnMut(&TrashEntry) -> bool,
    ) -> TrashResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut entries = pin!(self.list_trash_stream(ctx));
        let mut listed_any = false;

        loop {
            match entries.try_next().await {
                Ok(Some(entry)) => {
                    listed_any = true;
                    if selected(&entry) {
                        let outcome = self.purge(ctx, &entry.trash_key).await;
                        report.record(&entry.trash_key, outcome);
                    }
                }
                Ok(None) => break,
                Err(err) if !listed_any => return Err(err),
                Err(err) => {
                    warn!("listing trash of {} failed mid-scan: {}", ctx.bucket, err);
                    report.record_failure(&self.layout.root(), &err);
                    break;
                }
            }
        }

        info!(
            "[{}] purge of {}: {} removed, {} failed",
            ctx.profile,
            ctx.bucket,
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Copy `src` to a free `dst` and check the copy against `expected`.
    /// A mismatching copy is removed again and the source is left alone.
    async fn copy_verified(
        &self,
        ctx: &TrashContext,
        src: &str,
        dst: &str,
        expected: &ObjectMeta,
    ) -> TrashResult<ObjectMeta> {
        let copied = match self
            .call(
                ctx,
                dst,
                self.store
                    .copy_object(&ctx.bucket, src, dst, CopyMode::IfAbsent),
            )
            .await
        {
            Ok(meta) => meta,
            Err(TrashError::NotFound(_)) => return Err(TrashError::NotFound(src.to_string())),
            Err(err) => return Err(err),
        };

        if copied.same_content(expected) {
            return Ok(copied);
        }

        warn!(
            "copy {}/{} -> {} reported {} bytes (etag {:?}), expected {} bytes (etag {:?})",
            ctx.bucket,
            src,
            dst,
            copied.size_bytes,
            copied.etag,
            expected.size_bytes,
            expected.etag
        );
        if let Err(err) = self
            .call(ctx, dst, self.store.delete_object(&ctx.bucket, dst))
            .await
        {
            warn!("could not remove mismatched copy {}/{}: {}", ctx.bucket, dst, err);
        }
        Err(TrashError::IntegrityMismatch {
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }

    /// Run one store call, giving up early if the context is cancelled.
    async fn call<T>(
        &self,
        ctx: &TrashContext,
        key: &str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> TrashResult<T> {
        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(TrashError::Cancelled(key.to_string())),
            res = fut => res.map_err(|err| TrashError::from_store(err, key)),
        }
    }

    fn deletion_time(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
    }

    fn invalidate(&self, ctx: &TrashContext) {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ctx.snapshot_key());
    }
}

fn new_token() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(TOKEN_LEN);
    token
}
