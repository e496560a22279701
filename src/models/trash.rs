//! Soft-deleted objects and the per-context listing built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One soft-deleted object.
///
/// Entries are immutable. They are created when the object is relocated into
/// the trash namespace and disappear when it is purged or restored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TrashEntry {
    /// Key of the object before it was deleted.
    pub original_key: String,

    /// Key under the trash prefix where the bytes now live. Unique per entry.
    pub trash_key: String,

    /// When the object was moved to the trash (whole seconds, UTC).
    pub deleted_at: DateTime<Utc>,

    /// Size of the trashed payload.
    pub size_bytes: i64,

    /// Content hash reported by the store, if any.
    pub etag: Option<String>,
}

/// Trash entries of one (profile, bucket) pair, newest first.
///
/// An index is a snapshot of the store at `refreshed_at`. It is rebuilt on
/// every listing and is only meant for display.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrashIndex {
    pub profile: String,
    pub bucket: String,
    pub refreshed_at: DateTime<Utc>,
    entries: Vec<TrashEntry>,
}

impl TrashIndex {
    pub fn new(
        profile: impl Into<String>,
        bucket: impl Into<String>,
        refreshed_at: DateTime<Utc>,
        mut entries: Vec<TrashEntry>,
    ) -> Self {
        entries.sort_by(|a, b| {
            b.deleted_at
                .cmp(&a.deleted_at)
                .then_with(|| a.trash_key.cmp(&b.trash_key))
        });
        Self {
            profile: profile.into(),
            bucket: bucket.into(),
            refreshed_at,
            entries,
        }
    }

    pub fn entries(&self) -> &[TrashEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrashEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, trash_key: &str) -> Option<&TrashEntry> {
        self.entries.iter().find(|e| e.trash_key == trash_key)
    }

    /// Every deletion of `original_key`, newest first.
    pub fn for_original<'a>(
        &'a self,
        original_key: &'a str,
    ) -> impl Iterator<Item = &'a TrashEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.original_key == original_key)
    }

    /// Entries deleted strictly before `cutoff`.
    pub fn older_than(&self, cutoff: DateTime<Utc>) -> impl Iterator<Item = &TrashEntry> + '_ {
        self.entries.iter().filter(move |e| e.deleted_at < cutoff)
    }

    /// Total bytes held in the trash.
    pub fn total_bytes(&self) -> i64 {
        self.entries.iter().map(|e| e.size_bytes.max(0)).sum()
    }
}

impl IntoIterator for TrashIndex {
    type Item = TrashEntry;
    type IntoIter = std::vec::IntoIter<TrashEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a TrashIndex {
    type Item = &'a TrashEntry;
    type IntoIter = std::slice::Iter<'a, TrashEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(original: &str, trash: &str, secs: i64) -> TrashEntry {
        TrashEntry {
            original_key: original.into(),
            trash_key: trash.into(),
            deleted_at: Utc.timestamp_opt(secs, 0).unwrap(),
            size_bytes: 10,
            etag: None,
        }
    }

    #[test]
    fn index_orders_newest_first_with_stable_ties() {
        let index = TrashIndex::new(
            "default",
            "photos",
            Utc::now(),
            vec![
                entry("a", "t/a/1", 100),
                entry("b", "t/b/2", 300),
                entry("c", "t/c/z", 200),
                entry("c", "t/c/a", 200),
            ],
        );

        let keys: Vec<_> = index.iter().map(|e| e.trash_key.as_str()).collect();
        assert_eq!(keys, vec!["t/b/2", "t/c/a", "t/c/z", "t/a/1"]);
        assert_eq!(index.for_original("c").count(), 2);
        assert_eq!(index.total_bytes(), 40);
    }

    #[test]
    fn older_than_is_strict() {
        let index = TrashIndex::new(
            "default",
            "photos",
            Utc::now(),
            vec![entry("a", "t/a/1", 100), entry("b", "t/b/2", 200)],
        );

        let cutoff = Utc.timestamp_opt(200, 0).unwrap();
        let old: Vec<_> = index.older_than(cutoff).map(|e| e.original_key.as_str()).collect();
        assert_eq!(old, vec!["a"]);
        assert!(index.find("t/b/2").is_some());
        assert!(index.find("t/b/3").is_none());
    }
}
