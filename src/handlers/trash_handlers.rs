//! JSON endpoints over the trash coordinator.
//!
//! - `GET    /_trash/{bucket}`                          list entries
//! - `POST   /_trash/{bucket}/restore?key=..`           restore one entry
//! - `DELETE /_trash/{bucket}/entry?key=..&confirm=true` purge one entry
//! - `DELETE /_trash/{bucket}?confirm=true[&older_than=30d]` bulk purge
//!
//! Purges are irreversible, so they are refused unless the caller passes
//! `confirm=true`.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::{
    errors::AppError,
    handlers::profile_header,
    models::trash::{TrashEntry, TrashIndex},
    state::AppState,
    trash::BatchReport,
};

#[derive(Debug, Deserialize)]
pub struct EntryQuery {
    pub key: String,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkPurgeQuery {
    #[serde(default)]
    pub confirm: bool,
    /// humantime duration such as `7d`; absent means empty the whole trash.
    pub older_than: Option<String>,
}

fn require_confirmation(confirm: bool) -> Result<(), AppError> {
    if confirm {
        Ok(())
    } else {
        Err(AppError::bad_request("purge is irreversible; repeat with confirm=true")
            .with_kind("confirmation_required"))
    }
}

pub(crate) fn report_response(report: BatchReport) -> Response {
    let status = if report.is_complete() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(report)).into_response()
}

/// `GET /_trash/{bucket}`
pub async fn list_trash(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TrashIndex>, AppError> {
    let ctx = state.context(profile_header(&headers), &bucket);
    let index = state.trash.list_trash(&ctx).await?;
    Ok(Json(index))
}

/// `POST /_trash/{bucket}/restore?key=<trash key>`
pub async fn restore_entry(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(q): Query<EntryQuery>,
    headers: HeaderMap,
) -> Result<Json<TrashEntry>, AppError> {
    let ctx = state.context(profile_header(&headers), &bucket);
    let entry = state.trash.restore(&ctx, &q.key).await?;
    Ok(Json(entry))
}

/// `DELETE /_trash/{bucket}/entry?key=<trash key>&confirm=true`
pub async fn purge_entry(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(q): Query<EntryQuery>,
    headers: HeaderMap,
) -> Result<Json<TrashEntry>, AppError> {
    require_confirmation(q.confirm)?;
    let ctx = state.context(profile_header(&headers), &bucket);
    let entry = state.trash.purge(&ctx, &q.key).await?;
    Ok(Json(entry))
}

/// `DELETE /_trash/{bucket}?confirm=true[&older_than=<duration>]`
pub async fn purge_trash(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(q): Query<BulkPurgeQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_confirmation(q.confirm)?;
    let ctx = state.context(profile_header(&headers), &bucket);

    let report = match q.older_than.as_deref() {
        Some(raw) => {
            let age = humantime::parse_duration(raw)
                .map_err(|err| AppError::bad_request(format!("older_than `{}`: {}", raw, err)))?;
            state.trash.purge_older_than(&ctx, age).await?
        }
        None => state.trash.empty_trash(&ctx).await?,
    };

    Ok(report_response(report))
}
