use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ModelRole;

/// Accounting fields carried by the before/after/did-send notification
/// hooks. Used for billing and telemetry, never for control flow.
#[derive(Debug, Clone)]
pub struct RequestAccounting {
    pub purpose: String,
    pub role: ModelRole,
    pub model_id: String,
    pub model_name: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub first_token_at: Option<DateTime<Utc>>,
    /// Optional snapshot of the streamed content, redacted upstream if
    /// needed.
    pub streamed_content: Option<String>,
}

/// External collaborator notified around each model request. `will_send`
/// may veto the request (e.g. quota enforcement); `did_send` runs on a
/// supervised background task and its failures are reported, never
/// propagated into the request path.
#[async_trait]
pub trait RequestHooks: Send + Sync {
    async fn will_send(&self, _acct: &RequestAccounting) -> anyhow::Result<()> {
        Ok(())
    }

    async fn did_send(&self, _acct: RequestAccounting) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopHooks;

#[async_trait]
impl RequestHooks for NoopHooks {}
