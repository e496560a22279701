//! S3-flavoured bucket and object endpoints.
//!
//! Bodies stream straight between the socket and `StorageService`. Deletes
//! never remove data here: they hand the key to the trash coordinator. The
//! trash namespace is hidden from listings and closed to uploads, but stays
//! readable so a client can preview an entry before restoring it.

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::SecondsFormat;
use futures::StreamExt;
use serde::Deserialize;
use std::{fmt::Write as _, io};
use tokio_util::io::ReaderStream;

use crate::{
    errors::AppError,
    handlers::{profile_header, trash_handlers::report_response},
    models::{object::Object, trash::TrashEntry},
    services::storage_service::{ListObjectsParams, ListObjectsResult, StorageService},
    state::AppState,
    trash::{TrashError, TrashLayout},
};

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const MAX_LIST_KEYS: usize = 1000;

const TRASH_KEY_HEADER: &str = "x-xdrive-trash-key";
const DELETE_MARKER_HEADER: &str = "x-amz-delete-marker";

/// ListObjectsV2 query string.
#[derive(Debug, Deserialize)]
pub struct ListObjectsV2Query {
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    #[serde(rename = "LocationConstraint")]
    pub location_constraint: Option<String>,
}

/// PUT `/{bucket}/{*key}`
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    if state.trash.layout().is_reserved(&key) {
        return Err(TrashError::ReservedKey(key).into());
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let object = state
        .storage
        .upload_object_stream(&bucket, &key, content_type, stream)
        .await?;

    let mut response = StatusCode::OK.into_response();
    if let Some(etag) = quoted_etag(&object) {
        response.headers_mut().insert(header::ETAG, etag);
    }
    Ok(response)
}

/// GET `/{bucket}/{*key}`
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, file) = service.get_object_reader(&bucket, &key).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// HEAD `/{bucket}/{*key}`
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let meta = service.get_object_metadata(&bucket, &key).await?;
    let mut response = StatusCode::OK.into_response();
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// DELETE `/{bucket}/{*key}`: move the object to the trash.
///
/// Answers with the S3 `DeleteResult` document and names the new trash key
/// in `x-xdrive-trash-key`. A key ending in `/` moves the whole folder and
/// answers with the per-key JSON report instead.
pub async fn delete_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ctx = state.context(profile_header(&headers), &bucket);

    if key.ends_with('/') {
        let report = state.trash.soft_delete_prefix(&ctx, &key).await?;
        return Ok(report_response(report));
    }

    let entry = state.trash.soft_delete(&ctx, &key).await?;
    let mut response = xml_response(StatusCode::OK, delete_result_xml(&entry));
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(DELETE_MARKER_HEADER),
        HeaderValue::from_static("true"),
    );
    if let Ok(value) = HeaderValue::from_str(&entry.trash_key) {
        headers.insert(HeaderName::from_static(TRASH_KEY_HEADER), value);
    }
    Ok(response)
}

/// GET `/{bucket}?list-type=2&prefix=&delimiter=&max-keys=&continuation-token=`
///
/// The trash namespace is left out unless `prefix` points into it.
pub async fn list_objects(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(q): Query<ListObjectsV2Query>,
) -> Result<Response, AppError> {
    if q.list_type.unwrap_or(2) != 2 {
        return Err(AppError::bad_request("only list-type=2 is supported"));
    }

    let params = ListObjectsParams {
        prefix: q.prefix.clone(),
        delimiter: q.delimiter.clone(),
        continuation_token: q.continuation_token.as_deref().map(decode_continuation_token),
        start_after: q.start_after.clone(),
        max_keys: q.max_keys.unwrap_or(MAX_LIST_KEYS).clamp(1, MAX_LIST_KEYS),
    };

    let mut result = state.storage.list_objects_v2(&bucket, params.clone()).await?;
    let layout = state.trash.layout();
    if !params.prefix.as_deref().is_some_and(|p| layout.is_reserved(p)) {
        hide_trash(&mut result, layout);
    }

    let xml = list_objects_v2_xml(&bucket, &params, q.continuation_token.as_deref(), &result);
    Ok(xml_response(StatusCode::OK, xml))
}

/// PUT `/{bucket}`
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Json(payload): Json<Option<CreateBucketReq>>,
) -> Result<Response, AppError> {
    let region = payload
        .and_then(|p| p.location_constraint)
        .unwrap_or_else(|| "local".into());
    service.create_bucket(&bucket, region).await?;

    let xml = format!(
        "{XML_DECL}<CreateBucketResult xmlns=\"{S3_XMLNS}\"><Location>/{}</Location></CreateBucketResult>",
        xml_escape(&bucket)
    );
    Ok(xml_response(StatusCode::OK, xml))
}

/// DELETE `/{bucket}`
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn xml_response(status: StatusCode, xml: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        xml,
    )
        .into_response()
}

fn quoted_etag(meta: &Object) -> Option<HeaderValue> {
    let etag = meta.etag.as_deref()?;
    HeaderValue::from_str(&format!("\"{}\"", etag)).ok()
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));
    if let Some(etag) = quoted_etag(meta) {
        headers.insert(header::ETAG, etag);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

/// Drop trash keys, and the trash folder itself, from a listing.
fn hide_trash(result: &mut ListObjectsResult, layout: &TrashLayout) {
    result.objects.retain(|obj| !layout.is_reserved(&obj.key));
    result.common_prefixes.retain(|p| !layout.is_reserved(p));
    result.key_count = result.objects.len() + result.common_prefixes.len();
}

fn delete_result_xml(entry: &TrashEntry) -> String {
    format!(
        "{XML_DECL}<DeleteResult xmlns=\"{S3_XMLNS}\"><Deleted><Key>{}</Key>\
         <DeleteMarker>true</DeleteMarker></Deleted></DeleteResult>",
        xml_escape(&entry.original_key)
    )
}

fn list_objects_v2_xml(
    bucket: &str,
    params: &ListObjectsParams,
    continuation_token: Option<&str>,
    result: &ListObjectsResult,
) -> String {
    let mut xml = format!("{XML_DECL}<ListBucketResult xmlns=\"{S3_XMLNS}\">");
    let _ = write!(
        xml,
        "<Name>{}</Name><Prefix>{}</Prefix><MaxKeys>{}</MaxKeys><KeyCount>{}</KeyCount>",
        xml_escape(bucket),
        xml_escape(params.prefix.as_deref().unwrap_or("")),
        params.max_keys,
        result.key_count
    );
    if let Some(token) = continuation_token {
        let _ = write!(xml, "<ContinuationToken>{}</ContinuationToken>", xml_escape(token));
    }
    if let Some(start_after) = &params.start_after {
        let _ = write!(xml, "<StartAfter>{}</StartAfter>", xml_escape(start_after));
    }
    if let Some(delimiter) = &params.delimiter {
        let _ = write!(xml, "<Delimiter>{}</Delimiter>", xml_escape(delimiter));
    }
    let _ = write!(xml, "<IsTruncated>{}</IsTruncated>", result.is_truncated);
    if let Some(next) = &result.next_continuation_token {
        let _ = write!(
            xml,
            "<NextContinuationToken>{}</NextContinuationToken>",
            xml_escape(&encode_continuation_token(next))
        );
    }

    for obj in &result.objects {
        let _ = write!(
            xml,
            "<Contents><Key>{}</Key><LastModified>{}</LastModified><ETag>\"{}\"</ETag>\
             <Size>{}</Size><StorageClass>{}</StorageClass></Contents>",
            xml_escape(&obj.key),
            obj.last_modified.to_rfc3339_opts(SecondsFormat::Millis, true),
            xml_escape(obj.etag.as_deref().unwrap_or("")),
            obj.size_bytes,
            xml_escape(&obj.storage_class)
        );
    }
    for prefix in &result.common_prefixes {
        let _ = write!(
            xml,
            "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>",
            xml_escape(prefix)
        );
    }

    xml.push_str("</ListBucketResult>");
    xml
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

/// Tokens we did not issue are passed through as raw keys.
fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn object(key: &str) -> Object {
        Object {
            id: Uuid::new_v4(),
            bucket_id: Uuid::new_v4(),
            key: key.to_string(),
            filename: key.rsplit('/').next().unwrap_or(key).to_string(),
            content_type: None,
            size_bytes: 1,
            etag: Some("abc".into()),
            storage_class: "STANDARD".into(),
            last_modified: Utc::now(),
            version_id: None,
            is_deleted: false,
        }
    }

    #[test]
    fn listings_hide_the_trash_folder() {
        let layout = TrashLayout::default();
        let mut result = ListObjectsResult {
            objects: vec![object(".xdrive-trash/a/2024-01-01T00:00:00Z-ab"), object("a.txt")],
            common_prefixes: vec![".xdrive-trash/".into(), "docs/".into()],
            is_truncated: false,
            next_continuation_token: None,
            key_count: 4,
        };

        hide_trash(&mut result, &layout);

        let keys: Vec<_> = result.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a.txt"]);
        assert_eq!(result.common_prefixes, vec!["docs/".to_string()]);
        assert_eq!(result.key_count, 2);
    }

    #[test]
    fn delete_result_escapes_the_key() {
        let entry = TrashEntry {
            original_key: "a&b<c>.txt".into(),
            trash_key: ".xdrive-trash/a%26b%3Cc%3E.txt/2024-01-01T00:00:00Z-ab".into(),
            deleted_at: Utc::now(),
            size_bytes: 1,
            etag: None,
        };
        let xml = delete_result_xml(&entry);
        assert!(xml.contains("<Key>a&amp;b&lt;c&gt;.txt</Key>"));
        assert!(xml.contains("<DeleteMarker>true</DeleteMarker>"));
    }

    #[test]
    fn foreign_continuation_tokens_pass_through() {
        assert_eq!(decode_continuation_token(&encode_continuation_token("k/1")), "k/1");
        assert_eq!(decode_continuation_token("not base64!"), "not base64!");
    }
}
