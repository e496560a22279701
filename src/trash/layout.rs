//! Key layout of the trash namespace.
//!
//! `<prefix>/<percent-encoded original key>/<deleted_at>-<token>`
//!
//! The layout is persisted in every bucket that has ever held trash, so
//! entries written by older builds must keep parsing.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::trash::TrashEntry;
use crate::store::ObjectMeta;

pub const DEFAULT_TRASH_PREFIX: &str = ".xdrive-trash";
/// Longest accepted prefix. Keeps a trash key for any uploadable key within
/// the store's key limit.
pub const MAX_PREFIX_LEN: usize = 256;

/// Pieces recovered from a trash key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTrashKey {
    pub original_key: String,
    pub deleted_at: DateTime<Utc>,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashLayout {
    prefix: String,
}

impl Default for TrashLayout {
    fn default() -> Self {
        Self::new(DEFAULT_TRASH_PREFIX)
    }
}

impl TrashLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            DEFAULT_TRASH_PREFIX.to_string()
        } else {
            trimmed.to_string()
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Listing prefix covering every trash key, e.g. `.xdrive-trash/`.
    pub fn root(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// True for keys inside the trash namespace.
    pub fn is_reserved(&self, key: &str) -> bool {
        key.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    pub fn trash_key(&self, original_key: &str, deleted_at: DateTime<Utc>, token: &str) -> String {
        format!(
            "{}/{}/{}-{}",
            self.prefix,
            encode_key(original_key),
            deleted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            token
        )
    }

    /// Split a trash key back into its parts. `None` for anything that was
    /// not produced by `trash_key`.
    pub fn parse(&self, trash_key: &str) -> Option<ParsedTrashKey> {
        let rest = trash_key.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let (encoded, stamp) = rest.split_once('/')?;
        if encoded.is_empty() || stamp.contains('/') {
            return None;
        }
        let (when, token) = stamp.rsplit_once('-')?;
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        let deleted_at = DateTime::parse_from_rfc3339(when).ok()?.with_timezone(&Utc);
        let original_key = decode_key(encoded)?;
        if original_key.is_empty() {
            return None;
        }

        Some(ParsedTrashKey {
            original_key,
            deleted_at,
            token: token.to_string(),
        })
    }

    /// Build an entry from a listed trash object. `None` when the key does
    /// not follow the layout.
    pub fn entry_from_meta(&self, meta: &ObjectMeta) -> Option<TrashEntry> {
        let parsed = self.parse(&meta.key)?;
        Some(TrashEntry {
            original_key: parsed.original_key,
            trash_key: meta.key.clone(),
            deleted_at: parsed.deleted_at,
            size_bytes: meta.size_bytes,
            etag: meta.etag.clone(),
        })
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// Percent-encode every byte outside the RFC 3986 unreserved set.
pub fn encode_key(key: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        }
    }
    out
}

/// Inverse of `encode_key`. Accepts lowercase hex too.
pub fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_value(*bytes.get(i + 1)?)?;
                let lo = hex_value(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_year() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn builds_documented_key() {
        let layout = TrashLayout::default();
        assert_eq!(
            layout.trash_key("docs/report.pdf", new_year(), "ab12"),
            ".xdrive-trash/docs%2Freport.pdf/2024-01-01T00:00:00Z-ab12"
        );
    }

    #[test]
    fn parses_what_it_builds() {
        let layout = TrashLayout::new("/Trash/");
        let key = layout.trash_key("a b/ü-x~y.txt", new_year(), "deadbeef");
        assert!(key.starts_with("Trash/a%20b%2F%C3%BC-x~y.txt/"));

        let parsed = layout.parse(&key).unwrap();
        assert_eq!(parsed.original_key, "a b/ü-x~y.txt");
        assert_eq!(parsed.deleted_at, new_year());
        assert_eq!(parsed.token, "deadbeef");
    }

    #[test]
    fn accepts_offsets_and_fractional_seconds() {
        let layout = TrashLayout::default();
        let parsed = layout
            .parse(".xdrive-trash/a.txt/2024-01-01T02:00:00.250+02:00-ff")
            .unwrap();
        assert_eq!(
            parsed.deleted_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn rejects_foreign_keys() {
        let layout = TrashLayout::default();
        for key in [
            "docs/report.pdf",
            ".xdrive-trash/",
            ".xdrive-trash/docs%2Freport.pdf",
            ".xdrive-trash/docs/report.pdf/2024-01-01T00:00:00Z-ab12",
            ".xdrive-trash/docs%2Freport.pdf/yesterday-ab12",
            ".xdrive-trash/docs%2Freport.pdf/2024-01-01T00:00:00Z-",
            ".xdrive-trash/bad%zz/2024-01-01T00:00:00Z-ab12",
            ".xdrive-trashy/a/2024-01-01T00:00:00Z-ab12",
        ] {
            assert!(layout.parse(key).is_none(), "{key} should not parse");
        }
    }

    #[test]
    fn reserved_namespace_matches_whole_segment() {
        let layout = TrashLayout::default();
        assert!(layout.is_reserved(".xdrive-trash"));
        assert!(layout.is_reserved(".xdrive-trash/x"));
        assert!(!layout.is_reserved(".xdrive-trashcan/x"));
        assert!(!layout.is_reserved("docs/.xdrive-trash/x"));
    }

    #[test]
    fn worst_case_key_fits_the_store_limit() {
        use crate::services::storage_service::{MAX_OBJECT_KEY_LEN, MAX_STORED_KEY_LEN};

        let layout = TrashLayout::new("p".repeat(MAX_PREFIX_LEN));
        let original = "报".repeat(MAX_OBJECT_KEY_LEN / 3);
        let key = layout.trash_key(&original, new_year(), "deadbeef");
        assert!(key.len() <= MAX_STORED_KEY_LEN, "{} bytes", key.len());
    }
}
