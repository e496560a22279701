use tokio_util::sync::CancellationToken;

/// Who is asking and where: passed explicitly into every coordinator call.
#[derive(Debug, Clone)]
pub struct TrashContext {
    pub profile: String,
    pub bucket: String,
    cancel: CancellationToken,
}

impl TrashContext {
    pub fn new(profile: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            bucket: bucket.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this context to an outer token. Cancelling it aborts the store
    /// call in flight.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn snapshot_key(&self) -> (String, String) {
        (self.profile.clone(), self.bucket.clone())
    }
}
