use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use plait_types::{ModelError, TokenUsage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Canonical request handed to a provider client. How this maps onto any
/// particular vendor's wire format is the client's concern.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub provider: String,
    pub model_name: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Empty when the gateway applies the stop shim itself.
    pub stop: Vec<String>,
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

/// A lazy, finite, non-restartable sequence of content deltas. The consumer
/// pulls until the sequence ends or cancellation fires.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ModelError>> + Send>>;

/// Provider client seam. Implementations classify their failures into the
/// [`ModelError`] taxonomy; the gateway makes every fallback and retry
/// decision from that classification alone.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ModelError>;
}
