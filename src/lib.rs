//! Trash bin for S3-style buckets.
//!
//! Deletes become moves into a reserved prefix of the same bucket, so they
//! can be listed, undone or made permanent later. The coordinator talks to
//! storage only through the small `store::ObjectStore` trait; this crate
//! ships a SQLite + disk implementation and an in-memory one.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod trash;
