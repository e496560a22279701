use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
    response::Response,
};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use xdrive_trash::{
    db,
    routes::routes::routes,
    services::storage_service::StorageService,
    state::AppState,
    store::local::LocalObjectStore,
    trash::{TrashCoordinator, TrashLayout},
};

struct TestApp {
    router: Router,
    _dir: TempDir,
}

impl TestApp {
    async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let storage = StorageService::new(Arc::new(pool), dir.path());
        storage
            .create_bucket("photos", "local".into())
            .await
            .unwrap();

        let trash = TrashCoordinator::new(
            LocalObjectStore::new(storage.clone()),
            TrashLayout::default(),
        );
        let state = AppState::new(storage, trash, "default");
        Self {
            router: routes().with_state(state),
            _dir: dir,
        }
    }

    async fn send(&self, method: Method, uri: &str, body: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn json(&self, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = self.send(method, uri, "").await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

/// Query-string encoding for trash keys, which carry `%` and `:`.
fn q(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

/// Path encoding: like `q`, but `/` separates segments.
fn q_path(value: &str) -> String {
    value.split('/').map(q).collect::<Vec<_>>().join("/")
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn delete_list_restore_round_trip() {
    let app = TestApp::new().await;
    let put = app
        .send(Method::PUT, "/photos/docs/report.txt", "annual report")
        .await;
    assert_eq!(put.status(), StatusCode::OK);

    let deleted = app.send(Method::DELETE, "/photos/docs/report.txt", "").await;
    assert_eq!(deleted.status(), StatusCode::OK);
    assert_eq!(deleted.headers()["content-type"], "application/xml");
    assert_eq!(deleted.headers()["x-amz-delete-marker"], "true");
    let trash_key = deleted.headers()["x-xdrive-trash-key"]
        .to_str()
        .unwrap()
        .to_string();
    assert!(trash_key.starts_with(".xdrive-trash/docs%2Freport.txt/"));
    let xml = body_text(deleted).await;
    assert!(xml.contains("<DeleteResult"));
    assert!(xml.contains("<Key>docs/report.txt</Key>"));

    let gone = app.send(Method::GET, "/photos/docs/report.txt", "").await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);

    let (status, index) = app.json(Method::GET, "/_trash/photos").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(index["entries"].as_array().unwrap().len(), 1);
    assert_eq!(index["entries"][0]["original_key"], "docs/report.txt");
    assert_eq!(index["entries"][0]["trash_key"], trash_key.as_str());
    assert_eq!(index["entries"][0]["size_bytes"], 13);

    let (status, entry) = app
        .json(
            Method::POST,
            &format!("/_trash/photos/restore?key={}", q(&trash_key)),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["original_key"], "docs/report.txt");

    let back = app.send(Method::GET, "/photos/docs/report.txt", "").await;
    assert_eq!(back.status(), StatusCode::OK);
    assert_eq!(body_text(back).await, "annual report");

    let (_, index) = app.json(Method::GET, "/_trash/photos").await;
    assert!(index["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn restore_onto_live_key_is_a_conflict() {
    let app = TestApp::new().await;
    app.send(Method::PUT, "/photos/a.txt", "first").await;
    let deleted = app.send(Method::DELETE, "/photos/a.txt", "").await;
    let trash_key = deleted.headers()["x-xdrive-trash-key"]
        .to_str()
        .unwrap()
        .to_string();
    app.send(Method::PUT, "/photos/a.txt", "second").await;

    let (status, body) = app
        .json(
            Method::POST,
            &format!("/_trash/photos/restore?key={}", q(&trash_key)),
        )
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "already_exists");
    let live = app.send(Method::GET, "/photos/a.txt", "").await;
    assert_eq!(body_text(live).await, "second");
}

#[tokio::test]
async fn purges_need_confirmation() {
    let app = TestApp::new().await;
    app.send(Method::PUT, "/photos/a.txt", "a").await;
    let deleted = app.send(Method::DELETE, "/photos/a.txt", "").await;
    let trash_key = deleted.headers()["x-xdrive-trash-key"]
        .to_str()
        .unwrap()
        .to_string();

    let (status, body) = app
        .json(
            Method::DELETE,
            &format!("/_trash/photos/entry?key={}", q(&trash_key)),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "confirmation_required");

    let (status, _) = app
        .json(
            Method::DELETE,
            &format!("/_trash/photos/entry?key={}&confirm=true", q(&trash_key)),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .json(
            Method::DELETE,
            &format!("/_trash/photos/entry?key={}&confirm=true", q(&trash_key)),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn folder_delete_and_empty_trash_report_per_key() {
    let app = TestApp::new().await;
    for key in ["docs/a", "docs/b", "other/c"] {
        app.send(Method::PUT, &format!("/photos/{}", key), key).await;
    }

    let (status, report) = app.json(Method::DELETE, "/photos/docs/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["succeeded"].as_array().unwrap().len(), 2);
    assert!(report["failed"].as_array().unwrap().is_empty());

    let still = app.send(Method::GET, "/photos/other/c", "").await;
    assert_eq!(still.status(), StatusCode::OK);

    let (status, report) = app
        .json(Method::DELETE, "/_trash/photos?confirm=true&older_than=30d")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(report["succeeded"].as_array().unwrap().is_empty());

    let (status, report) = app.json(Method::DELETE, "/_trash/photos?confirm=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["succeeded"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn trash_namespace_and_bad_keys_are_rejected() {
    let app = TestApp::new().await;

    let (status, body) = app
        .json(Method::DELETE, "/photos/.xdrive-trash/anything")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "reserved_key");

    let (status, body) = app
        .json(Method::POST, "/_trash/photos/restore?key=plain.txt")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_trash_key");

    let (status, body) = app.json(Method::DELETE, "/photos/missing.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn trash_is_hidden_from_listings_and_closed_to_uploads() {
    let app = TestApp::new().await;
    app.send(Method::PUT, "/photos/keep.txt", "k").await;
    app.send(Method::PUT, "/photos/gone.txt", "g").await;
    app.send(Method::DELETE, "/photos/gone.txt", "").await;

    let listing = body_text(app.send(Method::GET, "/photos?delimiter=/", "").await).await;
    assert!(listing.contains("<Key>keep.txt</Key>"));
    assert!(!listing.contains(".xdrive-trash"));
    assert!(listing.contains("<KeyCount>1</KeyCount>"));

    let inside = body_text(
        app.send(Method::GET, "/photos?prefix=.xdrive-trash/", "")
            .await,
    )
    .await;
    assert!(inside.contains("gone.txt"));

    let (status, body) = app
        .json(Method::PUT, "/photos/.xdrive-trash/forged/2024-01-01T00:00:00Z-ab12")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "reserved_key");
}

#[tokio::test]
async fn long_and_non_ascii_keys_can_be_trashed_and_restored() {
    let app = TestApp::new().await;
    let wide = format!("文档/{}", "报".repeat(30));
    let uri = format!("/photos/{}", q_path(&wide));
    assert_eq!(app.send(Method::PUT, &uri, "wide").await.status(), StatusCode::OK);

    let deleted = app.send(Method::DELETE, &uri, "").await;
    assert_eq!(deleted.status(), StatusCode::OK);
    let trash_key = deleted.headers()["x-xdrive-trash-key"]
        .to_str()
        .unwrap()
        .to_string();

    let (status, entry) = app
        .json(
            Method::POST,
            &format!("/_trash/photos/restore?key={}", q(&trash_key)),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["original_key"], wide.as_str());
    assert_eq!(body_text(app.send(Method::GET, &uri, "").await).await, "wide");
}

#[tokio::test]
async fn healthz_reports_trash_prefix() {
    let app = TestApp::new().await;
    let (status, body) = app.json(Method::GET, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trash_prefix"], ".xdrive-trash");
}
