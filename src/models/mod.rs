//! Core data models.
//!
//! `bucket` and `object` map to the SQLite metadata tables via
//! `sqlx::FromRow`. `trash` describes soft-deleted objects as the trash
//! coordinator sees them; those records are derived from object keys and
//! never stored in a table of their own.

pub mod bucket;
pub mod object;
pub mod trash;
