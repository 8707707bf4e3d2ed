#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Lock-contention signature detected in git output. The retrying
    /// write executor removes stale lock artifacts and tries again; every
    /// other variant propagates immediately.
    #[error("git lock contention: {output}")]
    LockContention { output: String },
    #[error("git {op} failed: {output}")]
    Git { op: String, output: String },
    #[error("branch {branch} not found for plan {plan_id}")]
    BranchNotFound { plan_id: String, branch: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::LockContention { .. })
    }
}
