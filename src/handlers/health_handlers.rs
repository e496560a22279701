//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and disk I/O

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness only; never touches storage.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            trash_prefix: state.trash.layout().prefix().to_string(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. Runs `SELECT 1` against SQLite.
/// 2. Writes, reads back and removes a scratch file under the storage root.
///
/// HTTP 200 when both pass, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let service = &state.storage;

    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let scratch = service.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
    let disk = match fs::write(&scratch, b"readyz").await {
        Err(e) => CheckStatus::failed(format!("could not write scratch file: {}", e)),
        Ok(()) => {
            let read_back = fs::read(&scratch).await;
            let removed = fs::remove_file(&scratch).await;
            match (read_back, removed) {
                (Ok(bytes), _) if bytes != b"readyz" => {
                    CheckStatus::failed("scratch file content mismatch".to_string())
                }
                (Ok(_), Ok(())) => CheckStatus::ok(),
                (Ok(_), Err(e)) => CheckStatus {
                    ok: true,
                    error: Some(format!("could not remove scratch file: {}", e)),
                },
                (Err(e), _) => CheckStatus::failed(format!("could not read scratch file: {}", e)),
            }
        }
    };

    let overall_ok = sqlite.ok && disk.ok;
    let checks = HashMap::from([("sqlite", sqlite), ("disk", disk)]);

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if overall_ok { "ok" } else { "error" },
            checks,
        }),
    )
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    trash_prefix: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
