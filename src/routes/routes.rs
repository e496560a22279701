//! Defines routes for bucket, object and trash operations.
//!
//! ## Structure
//! - **Bucket-level endpoints**
//!   - `GET    /{bucket}`: list objects (supports prefix, delimiter, max-keys)
//!   - `PUT    /{bucket}`: create bucket
//!   - `DELETE /{bucket}`: delete bucket
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}`: upload object
//!   - `GET    /{bucket}/{*key}`: download object
//!   - `HEAD   /{bucket}/{*key}`: retrieve metadata only
//!   - `DELETE /{bucket}/{*key}`: move object (or folder) to the trash
//!
//! - **Trash endpoints** (`_trash` is never a valid bucket name)
//!   - `GET    /_trash/{bucket}`: list trash entries
//!   - `DELETE /_trash/{bucket}`: bulk purge (retention or empty)
//!   - `POST   /_trash/{bucket}/restore`: restore one entry
//!   - `DELETE /_trash/{bucket}/entry`: purge one entry
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            create_bucket, delete_bucket, delete_object, get_object, head_object, list_objects,
            upload_object,
        },
        trash_handlers::{list_trash, purge_entry, purge_trash, restore_entry},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build and return the router for all routes, carrying `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Trash routes
        .route("/_trash/{bucket}", get(list_trash).delete(purge_trash))
        .route("/_trash/{bucket}/restore", post(restore_entry))
        .route("/_trash/{bucket}/entry", delete(purge_entry))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(list_objects).put(create_bucket).delete(delete_bucket),
        )
}
