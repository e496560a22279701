//! StorageService: S3-like bucket and object operations backed by SQLite
//! for metadata and local disk for payloads, sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`.
//!
//! Server-side copy lives here too, since the trash coordinator relocates
//! objects with copy-then-delete and never moves bytes through the caller.

use crate::{
    models::{bucket::Bucket, object::Object},
    store::CopyMode,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sha2::{Digest, Sha256};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    collections::BTreeSet,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListObjectsResult {
    pub objects: Vec<Object>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub key_count: usize,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    ObjectAlreadyExists { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// StorageService provides basic S3-like operations:
/// - Upload an object (writes bytes to disk and inserts metadata into SQLite)
/// - Get object (reads metadata from SQLite and payload from disk)
/// - Copy object (duplicates the payload and metadata under a new key)
/// - List objects (query SQLite)
/// - Delete object (tombstones the row and removes the file)
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

/// Longest key a client may upload.
pub const MAX_OBJECT_KEY_LEN: usize = 1024;
/// Longest key the service stores at all. Server-side copies may target
/// keys past the upload limit: a trash key percent-encodes a live key (up to
/// three bytes per byte) beneath its prefix and deletion stamp.
pub const MAX_STORED_KEY_LEN: usize = 3 * MAX_OBJECT_KEY_LEN + 512;
const OBJECT_COLUMNS: &str = "id, bucket_id, key, filename, content_type, size_bytes, etag, \
     storage_class, last_modified, version_id, is_deleted";

/// Insert a live row, replacing whatever occupies `(bucket_id, key)`.
const UPSERT_OBJECT_SQL: &str = r#"
    INSERT INTO objects (
        id, bucket_id, key, filename, content_type, size_bytes,
        etag, storage_class, last_modified, version_id, is_deleted
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
    ON CONFLICT(bucket_id, key) DO UPDATE SET
        filename = excluded.filename,
        content_type = excluded.content_type,
        size_bytes = excluded.size_bytes,
        etag = excluded.etag,
        storage_class = excluded.storage_class,
        last_modified = excluded.last_modified,
        version_id = excluded.version_id,
        is_deleted = 0
    RETURNING id, bucket_id, key, filename, content_type, size_bytes,
              etag, storage_class, last_modified, version_id, is_deleted
"#;

/// Same as `UPSERT_OBJECT_SQL` but only a tombstoned row may be replaced.
/// Returns no row when the key is live.
const INSERT_IF_ABSENT_SQL: &str = r#"
    INSERT INTO objects (
        id, bucket_id, key, filename, content_type, size_bytes,
        etag, storage_class, last_modified, version_id, is_deleted
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
    ON CONFLICT(bucket_id, key) DO UPDATE SET
        filename = excluded.filename,
        content_type = excluded.content_type,
        size_bytes = excluded.size_bytes,
        etag = excluded.etag,
        storage_class = excluded.storage_class,
        last_modified = excluded.last_modified,
        version_id = excluded.version_id,
        is_deleted = 0
    WHERE objects.is_deleted = 1
    RETURNING id, bucket_id, key, filename, content_type, size_bytes,
              etag, storage_class, last_modified, version_id, is_deleted
"#;

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// S3-style key rules: no leading `/`, no `..`, no backslashes or control
    /// bytes, at most `MAX_STORED_KEY_LEN` bytes. Payload file names are
    /// digests, so key length and charset never reach the filesystem.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.len() > MAX_STORED_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    ///
    /// Ensures predictable directory structure and prevents invalid inputs.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let trimmed = name.trim();
        if trimmed != name {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "cannot begin or end with whitespace".into(),
            });
        }

        let len = name.len();
        if len < BUCKET_NAME_MIN_LEN || len > BUCKET_NAME_MAX_LEN {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "must be between 3 and 63 characters".into(),
            });
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "allowed characters are lowercase letters, digits, dots, and hyphens"
                    .into(),
            });
        }

        if name.starts_with('.')
            || name.ends_with('.')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "must start and end with a lowercase letter or digit".into(),
            });
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "cannot contain consecutive dots or dot-hyphen combinations".into(),
            });
        }

        if is_ipv4_like(name) {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "must not be formatted like an IP address".into(),
            });
        }

        Ok(())
    }

    /// Validate region string against SUPPORTED_REGIONS.
    ///
    /// Case-insensitive comparison. Returns UnsupportedRegion on mismatch.
    fn ensure_region_valid(&self, region: &str) -> StorageResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(StorageError::UnsupportedRegion(region.to_string()))
        }
    }
    /// Compute the physical base folder path for a bucket.
    ///
    /// This does not check for existence. Used for building object paths.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket_name);
        path
    }

    /// Payload path of `key`: `base_path/bucket/{aa}/{bb}/{sha256}`, where
    /// the digest is over `bucket/key` and `aa`/`bb` are its first two bytes.
    /// Fixed-length names keep long and non-ASCII keys within filesystem
    /// limits. Parent directories may not exist yet.
    pub(crate) fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(bucket_name.as_bytes());
        hasher.update(b"/");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();

        let mut path = self.bucket_root(bucket_name);
        path.push(hex::encode(&digest[..1]));
        path.push(hex::encode(&digest[1..2]));
        path.push(hex::encode(digest));
        path
    }

    /// Fetch bucket metadata from SQLite.
    ///
    /// Returns BucketNotFound if missing.
    /// Validates bucket name before querying.
    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<sqlx::sqlite::Sqlite, Bucket>(
            "SELECT id, name, owner_id, region, created_at, versioning_enabled
             FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch a non-deleted object metadata record.
    ///
    /// Queries SQLite by key and bucket_id.
    /// Returns ObjectNotFound if record missing or marked deleted.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE key = ? AND bucket_id = ? AND is_deleted = 0"
        ))
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Stream-upload an object to disk and update metadata.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Atomically renames into final location.
    /// - Upserts metadata row (S3-like overwrite semantics).
    ///
    /// Ensures durable writes (fsync) and cleans up temp files on errors.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;
        if key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        let etag = format!("{:x}", digest.compute());

        let row = NewObjectRow {
            bucket_id: bucket_rec.id,
            key,
            content_type,
            size_bytes,
            etag,
            last_modified: Utc::now(),
        };
        let insert_result = self.insert_object_row(UPSERT_OBJECT_SQL, row).await;

        match insert_result.and_then(|row| row.ok_or(sqlx::Error::RowNotFound)) {
            Ok(obj) => Ok(obj),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    /// Returns ObjectNotFound if metadata exists but physical file is missing.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    /// Fetch only object metadata.
    ///
    /// Verifies key format and bucket existence first.
    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_object(&bucket_rec, key).await
    }

    /// Server-side copy of `src` to `dst` inside one bucket.
    ///
    /// The payload is copied into a temp file next to the destination, the
    /// metadata row is written, and only then is the temp file renamed into
    /// place. With `CopyMode::IfAbsent` a live `dst` row makes the copy fail
    /// with `ObjectAlreadyExists` and leaves the destination untouched.
    /// The new row records the size and md5 of the bytes actually copied,
    /// so a short or damaged copy shows up against the source row.
    pub async fn copy_object(
        &self,
        bucket: &str,
        src: &str,
        dst: &str,
        mode: CopyMode,
    ) -> StorageResult<Object> {
        self.ensure_key_safe(src)?;
        self.ensure_key_safe(dst)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let source = self.fetch_object(&bucket_rec, src).await?;

        if mode == CopyMode::IfAbsent {
            match self.fetch_object(&bucket_rec, dst).await {
                Ok(_) => {
                    return Err(StorageError::ObjectAlreadyExists {
                        bucket: bucket.to_string(),
                        key: dst.to_string(),
                    });
                }
                Err(StorageError::ObjectNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let src_path = self.object_path(&bucket_rec.name, src);
        let dst_path = self.object_path(&bucket_rec.name, dst);
        let parent = dst_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        if let Err(err) = fs::copy(&src_path, &tmp_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(match err.kind() {
                ErrorKind::NotFound => StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: src.to_string(),
                },
                _ => StorageError::Io(err),
            });
        }
        let (size_bytes, etag) = match file_digest(&tmp_path).await {
            Ok(measured) => measured,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };
        if size_bytes != source.size_bytes || source.etag.as_deref() != Some(etag.as_str()) {
            warn!(
                "copy {}/{} -> {} holds {} bytes (md5 {}), source row says {} bytes (md5 {:?})",
                bucket, src, dst, size_bytes, etag, source.size_bytes, source.etag
            );
        }

        let row = NewObjectRow {
            bucket_id: bucket_rec.id,
            key: dst,
            content_type: source.content_type.clone(),
            size_bytes,
            etag,
            last_modified: Utc::now(),
        };
        let sql = match mode {
            CopyMode::Overwrite => UPSERT_OBJECT_SQL,
            CopyMode::IfAbsent => INSERT_IF_ABSENT_SQL,
        };

        let copied = match self.insert_object_row(sql, row).await {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::ObjectAlreadyExists {
                    bucket: bucket.to_string(),
                    key: dst.to_string(),
                });
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &dst_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            if let Err(revert) =
                sqlx::query("UPDATE objects SET is_deleted = 1 WHERE key = ? AND bucket_id = ?")
                    .bind(dst)
                    .bind(bucket_rec.id)
                    .execute(&*self.db)
                    .await
            {
                warn!("could not tombstone {} after failed rename: {}", dst, revert);
            }
            return Err(StorageError::Io(err));
        }

        debug!("copied {}/{} -> {}/{}", bucket, src, bucket, dst);
        Ok(copied)
    }

    /// Write one metadata row with `sql` (one of the upsert statements).
    async fn insert_object_row(
        &self,
        sql: &str,
        row: NewObjectRow<'_>,
    ) -> Result<Option<Object>, sqlx::Error> {
        let filename = row.key.split('/').last().unwrap_or(row.key).to_string();
        sqlx::query_as::<_, Object>(sql)
            .bind(Uuid::new_v4())
            .bind(row.bucket_id)
            .bind(row.key)
            .bind(&filename)
            .bind(row.content_type)
            .bind(row.size_bytes)
            .bind(&row.etag)
            .bind("STANDARD")
            .bind(row.last_modified)
            .bind::<Option<String>>(None)
            .fetch_optional(&*self.db)
            .await
    }

    /// List objects following S3 ListObjectsV2 rules.
    ///
    /// Supports:
    /// - prefix filtering
    /// - delimiter grouping
    /// - continuation tokens
    /// - lexicographical ordering
    /// - soft-deleted filtering
    ///
    /// Returns objects, common prefixes, truncation status, and next token.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> StorageResult<ListObjectsResult> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let max_keys = params.max_keys.clamp(1, 1000);
        let fetch_limit = max_keys + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket_id = "
        ));
        builder.push_bind(bucket_rec.id);
        builder.push(" AND is_deleted = 0");

        // LIKE would treat `%` and `_` in keys as wildcards and fold ASCII case.
        if let Some(prefix) = params.prefix.as_ref().filter(|p| !p.is_empty()) {
            builder.push(" AND substr(key, 1, length(");
            builder.push_bind(prefix.clone());
            builder.push(")) = ");
            builder.push_bind(prefix.clone());
        }

        if let Some(token) = params
            .continuation_token
            .as_ref()
            .or(params.start_after.as_ref())
        {
            builder.push(" AND key > ");
            builder.push_bind(token);
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<Object> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut is_truncated = false;
        let mut next_continuation_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_continuation_token = rows.last().map(|last| last.key.clone());
            is_truncated = true;
        }

        let mut contents = Vec::new();
        let mut common_prefixes = BTreeSet::new();
        for obj in rows.into_iter() {
            if let Some(delim) = &params.delimiter {
                if let Some(prefix) =
                    compute_common_prefix(&obj.key, params.prefix.as_deref(), delim)
                {
                    common_prefixes.insert(prefix);
                    continue;
                }
            }
            contents.push(obj);
        }

        let key_count = contents.len() + common_prefixes.len();

        Ok(ListObjectsResult {
            objects: contents,
            common_prefixes: common_prefixes.into_iter().collect(),
            is_truncated,
            next_continuation_token,
            key_count,
        })
    }

    /// Soft-delete an object and attempt to remove its payload.
    ///
    /// - Sets `is_deleted = 1`
    /// - Deletes physical file best-effort
    /// - Prunes empty bucket directories
    ///
    /// Idempotent: repeated calls return ObjectNotFound if already deleted.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let result =
            sqlx::query("UPDATE objects SET is_deleted = 1 WHERE key = ? AND bucket_id = ?")
                .bind(key)
                .bind(bucket_rec.id)
                .execute(&*self.db)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket_rec.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(object)
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Validates name and region. Inserts metadata row.
    /// Returns BucketAlreadyExists if name conflict occurs.
    ///
    /// Creates the bucket folder on disk.
    pub async fn create_bucket(&self, name: &str, region: String) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;
        let bucket_root = self.bucket_root(name);
        fs::create_dir_all(&bucket_root).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id: Uuid::new_v4(),
            region: normalized_region.clone(),
            created_at: Utc::now(),
            versioning_enabled: false,
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, owner_id, region, created_at, versioning_enabled)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(bucket.owner_id)
        .bind(&normalized_region)
        .bind(bucket.created_at)
        .bind(bucket.versioning_enabled)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Delete a bucket from metadata and filesystem.
    ///
    /// - Removes metadata row
    /// - Attempts to recursively delete bucket directory
    /// - Ignores missing directory errors
    ///
    /// Returns BucketNotFound if DB row missing.
    pub async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        self.ensure_bucket_name_safe(name)?;
        let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::BucketNotFound(name.to_string()));
        }

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }

        Ok(())
    }

    /// Recursively remove empty directories up to bucket root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Values for a fresh metadata row.
struct NewObjectRow<'a> {
    bucket_id: Uuid,
    key: &'a str,
    content_type: Option<String>,
    size_bytes: i64,
    etag: String,
    last_modified: DateTime<Utc>,
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Compute a synthetic "common prefix" for S3 list semantics.
///
/// Used only when a delimiter is provided. Returns Some(prefix) if the key
/// belongs to a grouped prefix, otherwise None.
fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let after_prefix = if let Some(prefix) = requested_prefix {
        if key.starts_with(prefix) {
            &key[prefix.len()..]
        } else {
            return None;
        }
    } else {
        key
    };

    if let Some(pos) = after_prefix.find(delimiter) {
        let mut combined = String::new();
        if let Some(prefix) = requested_prefix {
            combined.push_str(prefix);
        }
        combined.push_str(&after_prefix[..pos + delimiter.len()]);
        Some(combined)
    } else {
        None
    }
}

/// Size and hex md5 of the file at `path`, read in chunks.
async fn file_digest(path: &Path) -> io::Result<(i64, String)> {
    let mut file = File::open(path).await?;
    let mut digest = Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size_bytes: i64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        size_bytes += n as i64;
        digest.consume(&buf[..n]);
    }
    Ok((size_bytes, format!("{:x}", digest.compute())))
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    for segment in parts {
        if segment.is_empty() || segment.len() > 3 {
            return false;
        }
        if segment.chars().any(|c| !c.is_ascii_digit()) {
            return false;
        }
        if segment.parse::<u8>().is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use futures::stream;

    async fn service() -> (StorageService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let svc = StorageService::new(Arc::new(memory_pool().await), dir.path());
        svc.create_bucket("photos", "local".into()).await.unwrap();
        (svc, dir)
    }

    async fn put(svc: &StorageService, key: &str, body: &'static [u8]) -> Object {
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(body))]);
        svc.upload_object_stream("photos", key, Some("text/plain".into()), body)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upload_records_size_and_md5() {
        let (svc, _dir) = service().await;
        let obj = put(&svc, "docs/a.txt", b"hello").await;

        assert_eq!(obj.size_bytes, 5);
        assert_eq!(obj.etag.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
        assert_eq!(obj.filename, "a.txt");
    }

    #[tokio::test]
    async fn copy_if_absent_refuses_live_destination() {
        let (svc, _dir) = service().await;
        put(&svc, "a.txt", b"first").await;
        put(&svc, "b.txt", b"second").await;

        let err = svc
            .copy_object("photos", "a.txt", "b.txt", CopyMode::IfAbsent)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ObjectAlreadyExists { .. }));

        let b = svc.get_object_metadata("photos", "b.txt").await.unwrap();
        assert_eq!(b.size_bytes, 6);
    }

    #[tokio::test]
    async fn copy_if_absent_reuses_tombstoned_row() {
        let (svc, _dir) = service().await;
        put(&svc, "a.txt", b"first").await;
        put(&svc, "b.txt", b"second").await;
        svc.delete_object("photos", "b.txt").await.unwrap();

        let copied = svc
            .copy_object("photos", "a.txt", "b.txt", CopyMode::IfAbsent)
            .await
            .unwrap();
        assert_eq!(copied.size_bytes, 5);

        let (_, mut file) = svc.get_object_reader("photos", "b.txt").await.unwrap();
        let mut body = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut file, &mut body)
            .await
            .unwrap();
        assert_eq!(body, "first");
    }

    #[tokio::test]
    async fn copy_overwrite_replaces_destination() {
        let (svc, _dir) = service().await;
        let a = put(&svc, "a.txt", b"first").await;
        put(&svc, "b.txt", b"second").await;

        let copied = svc
            .copy_object("photos", "a.txt", "b.txt", CopyMode::Overwrite)
            .await
            .unwrap();
        assert_eq!(copied.etag, a.etag);
    }

    #[tokio::test]
    async fn copy_of_missing_source_is_not_found() {
        let (svc, _dir) = service().await;
        let err = svc
            .copy_object("photos", "nope.txt", "b.txt", CopyMode::IfAbsent)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn prefix_listing_is_literal_and_pages_without_gaps() {
        let (svc, _dir) = service().await;
        put(&svc, "t/a%2Fb/1", b"x").await;
        put(&svc, "t/a%2Fb/2", b"x").await;
        put(&svc, "t/a%2Fb/3", b"x").await;
        put(&svc, "t/aX2Fb/1", b"x").await;
        put(&svc, "T/a%2Fb/1", b"x").await;

        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = svc
                .list_objects_v2(
                    "photos",
                    ListObjectsParams {
                        prefix: Some("t/a%2F".into()),
                        delimiter: None,
                        continuation_token: token.clone(),
                        start_after: None,
                        max_keys: 2,
                    },
                )
                .await
                .unwrap();
            seen.extend(page.objects.into_iter().map(|o| o.key));
            if !page.is_truncated {
                break;
            }
            token = page.next_continuation_token;
        }

        assert_eq!(seen, vec!["t/a%2Fb/1", "t/a%2Fb/2", "t/a%2Fb/3"]);
    }

    #[tokio::test]
    async fn rejects_unsafe_names() {
        let (svc, _dir) = service().await;
        assert!(matches!(
            svc.create_bucket("Bad_Name", "local".into()).await,
            Err(StorageError::InvalidBucketName { .. })
        ));
        assert!(matches!(
            svc.get_object_metadata("photos", "../etc/passwd").await,
            Err(StorageError::InvalidObjectKey)
        ));
    }

    #[tokio::test]
    async fn payload_file_names_do_not_depend_on_key_length() {
        let (svc, _dir) = service().await;
        let key = format!("文档/{}", "报".repeat(300));
        put(&svc, &key, b"wide").await;

        let path = svc.object_path("photos", &key);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64);
        assert!(path.is_file());

        let (meta, _) = svc.get_object_reader("photos", &key).await.unwrap();
        assert_eq!(meta.size_bytes, 4);
    }

    #[tokio::test]
    async fn copies_may_exceed_the_upload_key_limit() {
        let (svc, _dir) = service().await;
        let too_long = "k".repeat(MAX_OBJECT_KEY_LEN + 1);
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"x"))]);
        assert!(matches!(
            svc.upload_object_stream("photos", &too_long, None, body).await,
            Err(StorageError::InvalidObjectKey)
        ));

        put(&svc, "a.txt", b"x").await;
        let far = "t".repeat(3 * MAX_OBJECT_KEY_LEN);
        svc.copy_object("photos", "a.txt", &far, CopyMode::IfAbsent)
            .await
            .unwrap();
        assert!(svc.get_object_metadata("photos", &far).await.is_ok());

        let beyond = "t".repeat(MAX_STORED_KEY_LEN + 1);
        assert!(matches!(
            svc.copy_object("photos", "a.txt", &beyond, CopyMode::IfAbsent).await,
            Err(StorageError::InvalidObjectKey)
        ));
    }

    #[tokio::test]
    async fn copy_reports_the_bytes_it_actually_wrote() {
        let (svc, _dir) = service().await;
        let source = put(&svc, "a.txt", b"hello world").await;
        // payload damaged behind the service's back
        std::fs::write(svc.object_path("photos", "a.txt"), b"hello").unwrap();

        let copied = svc
            .copy_object("photos", "a.txt", "b.txt", CopyMode::IfAbsent)
            .await
            .unwrap();

        assert_eq!(copied.size_bytes, 5);
        assert_eq!(copied.etag.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
        assert_ne!(copied.etag, source.etag);
    }

    #[test]
    fn common_prefix_groups_by_delimiter() {
        assert_eq!(
            compute_common_prefix("docs/2024/a.txt", Some("docs/"), "/"),
            Some("docs/2024/".to_string())
        );
        assert_eq!(compute_common_prefix("docs/a.txt", Some("docs/"), "/"), None);
        assert!(is_ipv4_like("192.168.0.1"));
        assert!(!is_ipv4_like("photos.example"));
    }
}
