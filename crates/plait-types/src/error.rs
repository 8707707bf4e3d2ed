use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    Overloaded,
    ContextTooLong,
    RateLimited,
    QuotaExhausted,
    CacheUnsupported,
    Other,
}

/// Classified provider failure. `retriable` and `retry_after` come from the
/// provider client's classification; the fallback decision table in
/// plait-models consumes both.
#[derive(Debug, Clone, thiserror::Error)]
#[error("model error ({kind:?}, retriable: {retriable}): {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub retriable: bool,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, retriable: bool, message: impl Into<String>) -> Self {
        Self {
            kind,
            retriable,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    /// Quota exhaustion and cache-support errors are not the model's fault
    /// and do not count against the retry budget.
    pub fn should_increment_retry(&self) -> bool {
        !matches!(
            self.kind,
            ModelErrorKind::QuotaExhausted | ModelErrorKind::CacheUnsupported
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("plan {plan_id} already has an active stream on branch {branch}")]
    AlreadyActive { plan_id: String, branch: String },
    #[error("no active plan found for plan {plan_id} on branch {branch}")]
    NotFound { plan_id: String, branch: String },
    /// A state mutator panicked. The entry is torn down and subscribers get
    /// a terminal error event; the registry table itself stays intact.
    #[error("active plan mutator panicked: {detail}")]
    MutatorPanicked { detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("syntax invalid for {path}: {detail}")]
    SyntaxInvalid { path: String, detail: String },
    #[error("syntax validation timed out for {path}")]
    ValidationTimeout { path: String },
    #[error("build retries exhausted for {path}")]
    RetriesExhausted { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_and_cache_errors_do_not_burn_retries() {
        let quota = ModelError::new(ModelErrorKind::QuotaExhausted, true, "quota");
        let cache = ModelError::new(ModelErrorKind::CacheUnsupported, false, "cache");
        let overloaded = ModelError::new(ModelErrorKind::Overloaded, true, "overloaded");
        assert!(!quota.should_increment_retry());
        assert!(!cache.should_increment_retry());
        assert!(overloaded.should_increment_retry());
    }
}
