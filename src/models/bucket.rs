use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Row of the `buckets` table. Each bucket carries its own trash namespace
/// under the configured prefix, so there is nothing trash-specific here.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    pub id: Uuid,
    /// DNS-style name; `_trash` can never be one since `_` is rejected.
    pub name: String,
    pub owner_id: Uuid,
    pub region: String,
    pub created_at: DateTime<Utc>,
    /// Always false. Restores would otherwise need to pick a version.
    pub versioning_enabled: bool,
}
