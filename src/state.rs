//! Shared state handed to every HTTP handler.

use axum::extract::FromRef;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    services::storage_service::StorageService,
    store::local::LocalObjectStore,
    trash::{TrashContext, TrashCoordinator},
};

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub trash: Arc<TrashCoordinator<LocalObjectStore>>,
    pub default_profile: String,
    /// Cancelled on shutdown; every request context derives from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        storage: StorageService,
        trash: TrashCoordinator<LocalObjectStore>,
        default_profile: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            trash: Arc::new(trash),
            default_profile: default_profile.into(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Context for one request against `bucket`.
    pub fn context(&self, profile: Option<&str>, bucket: &str) -> TrashContext {
        let profile = profile
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.default_profile);
        TrashContext::new(profile, bucket).with_cancel(self.shutdown.child_token())
    }
}

impl FromRef<AppState> for StorageService {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}
