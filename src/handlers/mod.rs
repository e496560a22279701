use axum::http::HeaderMap;

pub mod health_handlers;
pub mod object_handlers;
pub mod trash_handlers;

/// Header naming the profile a request acts for.
pub const PROFILE_HEADER: &str = "x-xdrive-profile";

pub(crate) fn profile_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(PROFILE_HEADER).and_then(|v| v.to_str().ok())
}
