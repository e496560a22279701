use serde::Serialize;

use super::error::TrashError;
use crate::models::trash::TrashEntry;

/// One key a bulk operation could not handle.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BatchFailure {
    pub key: String,
    pub kind: &'static str,
    pub error: String,
    pub retryable: bool,
}

/// Per-key outcome of a bulk operation. A failure never hides the
/// successes that came before or after it.
#[derive(Serialize, Clone, Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<TrashEntry>,
    pub failed: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn record(&mut self, key: &str, outcome: Result<TrashEntry, TrashError>) {
        match outcome {
            Ok(entry) => self.succeeded.push(entry),
            Err(err) => self.record_failure(key, &err),
        }
    }

    pub fn record_failure(&mut self, key: &str, err: &TrashError) {
        self.failed.push(BatchFailure {
            key: key.to_string(),
            kind: err.kind(),
            error: err.to_string(),
            retryable: err.is_retryable(),
        });
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
