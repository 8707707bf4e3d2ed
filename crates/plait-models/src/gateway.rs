use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use plait_observability::{emit_event, FailureReporter, ObservabilityEvent, ProcessKind};
use plait_types::{estimate_tokens, ModelError, ModelErrorKind, TokenUsage};

use crate::{
    ChatMessage, CompletionRequest, FallbackType, ModelClient, ModelRoleConfig, RequestAccounting,
    RequestHooks, StreamChunk, ToolSchema,
};

/// Flat per-request token overhead on top of the message estimate.
pub const TOKENS_PER_REQUEST: u64 = 3;

/// Hard ceiling on retriable attempts counted by the retry budget.
pub const MAX_TOTAL_RETRIES: u32 = 4;

/// Absolute attempt ceiling. Errors that don't burn the retry budget
/// (quota, cache support) still count here so a misbehaving provider
/// cannot spin the loop forever.
pub const MAX_TOTAL_ATTEMPTS: u32 = 10;

const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(16);

#[derive(Debug, Clone)]
pub struct RequestParams {
    pub purpose: String,
    pub messages: Vec<ChatMessage>,
    pub stop: Vec<String>,
    pub tools: Vec<ToolSchema>,
    pub estimated_output_tokens: Option<u64>,
    /// Tokens the provider is expected to serve from cache; used for
    /// accounting when the provider reports no usage.
    pub will_cache_tokens: u64,
}

impl RequestParams {
    pub fn new(purpose: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            purpose: purpose.into(),
            messages,
            stop: Vec::new(),
            tools: Vec::new(),
            estimated_output_tokens: None,
            will_cache_tokens: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub finish_reason: String,
    pub usage: TokenUsage,
    pub model_id: String,
    pub model_name: String,
    pub provider: String,
    pub first_token_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Events surfaced to the streaming consumer while a request (or its
/// retries) runs. A new `AttemptStarted` means any deltas from the previous
/// attempt are stale; the consumer decides what to do with them.
#[derive(Debug)]
pub enum StreamEvent<'a> {
    AttemptStarted {
        attempt: u32,
        model_id: &'a str,
        provider: &'a str,
    },
    Delta(&'a str),
}

/// Maps a logical role + token budget to an actual provider request and
/// degrades predictably on failure.
pub struct ModelGateway {
    client: Arc<dyn ModelClient>,
    hooks: Arc<dyn RequestHooks>,
    providers: Vec<crate::ProviderOption>,
    reporter: FailureReporter,
}

impl ModelGateway {
    pub fn new(
        client: Arc<dyn ModelClient>,
        hooks: Arc<dyn RequestHooks>,
        providers: Vec<crate::ProviderOption>,
        reporter: FailureReporter,
    ) -> Self {
        Self {
            client,
            hooks,
            providers,
            reporter,
        }
    }

    pub fn providers(&self) -> &[crate::ProviderOption] {
        &self.providers
    }

    /// One request attempt: role selection for the token budget, will-send
    /// hook, provider stream consumption with the stop-sequence shim, usage
    /// reconciliation, and a supervised did-send hook.
    pub async fn request(
        &self,
        config: &ModelRoleConfig,
        attempt: u32,
        params: &RequestParams,
        on_stream: &mut (dyn FnMut(StreamEvent<'_>) + Send),
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let messages = filter_empty_messages(&params.messages);
        let input_estimate = messages_token_estimate(&messages) + TOKENS_PER_REQUEST;

        let mut selected = config.role_for_input_tokens(input_estimate);
        if let Some(est_out) = params.estimated_output_tokens {
            selected = selected.role_for_output_tokens(est_out);
        }
        let model = &selected.model;

        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                status: Some("start"),
                model_id: Some(&model.model_id),
                provider_id: Some(&model.provider),
                detail: Some(&params.purpose),
                ..ObservabilityEvent::new("model.request.start", "models.gateway")
            },
        );

        let started_at = Utc::now();
        let expected_output = params
            .estimated_output_tokens
            .unwrap_or_else(|| model.max_output_tokens.saturating_sub(input_estimate));

        let mut acct = RequestAccounting {
            purpose: params.purpose.clone(),
            role: selected.role,
            model_id: model.model_id.clone(),
            model_name: model.model_name.clone(),
            provider: model.provider.clone(),
            input_tokens: input_estimate,
            output_tokens: expected_output,
            cached_tokens: 0,
            started_at,
            first_token_at: None,
            streamed_content: None,
        };

        self.hooks
            .will_send(&acct)
            .await
            .map_err(|err| ModelError::new(ModelErrorKind::Other, false, format!("{err:#}")))?;

        let req = CompletionRequest {
            provider: model.provider.clone(),
            model_name: model.model_name.clone(),
            messages,
            temperature: (!model.role_params_disabled).then_some(selected.temperature),
            top_p: (!model.role_params_disabled).then_some(selected.top_p),
            stop: if model.stop_disabled {
                Vec::new()
            } else {
                params.stop.clone()
            },
            tools: params.tools.clone(),
        };

        on_stream(StreamEvent::AttemptStarted {
            attempt,
            model_id: &model.model_id,
            provider: &model.provider,
        });

        let mut stream = self.client.stream(req, cancel.child_token()).await?;

        let mut content = String::new();
        let mut finish_reason = "stop".to_string();
        let mut usage: Option<TokenUsage> = None;
        let mut first_token_at = None;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(ModelError::new(
                    ModelErrorKind::Other,
                    false,
                    "request cancelled",
                ));
            }
            match chunk? {
                StreamChunk::TextDelta(delta) => {
                    if first_token_at.is_none() {
                        first_token_at = Some(Utc::now());
                        emit_event(
                            Level::INFO,
                            ProcessKind::Server,
                            ObservabilityEvent {
                                status: Some("streaming"),
                                model_id: Some(&model.model_id),
                                provider_id: Some(&model.provider),
                                detail: Some("first text delta"),
                                ..ObservabilityEvent::new(
                                    "model.request.first_byte",
                                    "models.gateway",
                                )
                            },
                        );
                    }
                    content.push_str(&delta);
                    on_stream(StreamEvent::Delta(&delta));
                    // shim for providers lacking native stop-sequence
                    // support: stop pulling once any stop string appears in
                    // the accumulating buffer; final truncation below
                    if model.stop_disabled
                        && params.stop.iter().any(|s| content.contains(s.as_str()))
                    {
                        break;
                    }
                }
                StreamChunk::Done {
                    finish_reason: reason,
                    usage: chunk_usage,
                } => {
                    finish_reason = reason;
                    usage = chunk_usage;
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ModelError::new(
                ModelErrorKind::Other,
                false,
                "request cancelled",
            ));
        }

        if model.stop_disabled && !params.stop.is_empty() {
            if let Some(earliest) = params
                .stop
                .iter()
                .filter_map(|s| content.find(s.as_str()))
                .min()
            {
                content.truncate(earliest);
            }
        }

        // reconcile actual usage against the estimates used for selection
        let usage = match usage {
            Some(reported) => reported,
            None => TokenUsage {
                input_tokens: input_estimate,
                output_tokens: estimate_tokens(&content),
                cached_tokens: params.will_cache_tokens,
            },
        };

        acct.input_tokens = usage.input_tokens;
        acct.output_tokens = usage.output_tokens;
        acct.cached_tokens = usage.cached_tokens;
        acct.first_token_at = first_token_at;
        acct.streamed_content = Some(content.clone());

        let hooks = Arc::clone(&self.hooks);
        self.reporter
            .spawn_supervised("models.gateway.did_send", async move {
                hooks.did_send(acct).await
            });

        Ok(ModelResponse {
            content,
            finish_reason,
            usage,
            model_id: model.model_id.clone(),
            model_name: model.model_name.clone(),
            provider: model.provider.clone(),
            first_token_at,
        })
    }

    /// Full layered-degradation loop: retry in place while the budget
    /// allows, then walk context/error/provider fallbacks per the decision
    /// table, bounded by both the retry budget and an absolute attempt
    /// ceiling.
    pub async fn request_with_retries(
        &self,
        config: &ModelRoleConfig,
        params: &RequestParams,
        on_stream: &mut (dyn FnMut(StreamEvent<'_>) + Send),
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let mut current = config.clone();
        let mut num_total_retries: u32 = 0;
        let mut did_provider_fallback = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match self
                .request(&current, attempt, params, on_stream, cancel)
                .await
            {
                Ok(res) => return Ok(res),
                Err(err) => err,
            };

            if cancel.is_cancelled() {
                return Err(err);
            }
            if err.should_increment_retry() {
                num_total_retries += 1;
            }
            if num_total_retries > MAX_TOTAL_RETRIES || attempt >= MAX_TOTAL_ATTEMPTS {
                emit_event(
                    Level::ERROR,
                    ProcessKind::Server,
                    ObservabilityEvent {
                        status: Some("failed"),
                        model_id: Some(&current.model.model_id),
                        error_code: Some("RETRIES_EXHAUSTED"),
                        detail: Some(&err.message),
                        ..ObservabilityEvent::new("model.request.error", "models.gateway")
                    },
                );
                return Err(err);
            }

            let decision = current.fallback_for_error(
                num_total_retries,
                did_provider_fallback,
                &err,
                &self.providers,
            );
            if decision.fallback == Some(FallbackType::Provider) {
                did_provider_fallback = true;
            }
            if !decision.is_fallback() && !err.retriable {
                return Err(err);
            }

            emit_event(
                Level::WARN,
                ProcessKind::Server,
                ObservabilityEvent {
                    status: Some("retrying"),
                    model_id: Some(&decision.config.model.model_id),
                    provider_id: Some(&decision.config.model.provider),
                    error_code: Some(match decision.fallback {
                        Some(FallbackType::Context) => "FALLBACK_CONTEXT",
                        Some(FallbackType::Error) => "FALLBACK_ERROR",
                        Some(FallbackType::Provider) => "FALLBACK_PROVIDER",
                        None => "RETRY_SAME",
                    }),
                    detail: Some(&err.message),
                    ..ObservabilityEvent::new("model.request.retry", "models.gateway")
                },
            );

            let delay = err
                .retry_after
                .unwrap_or_else(|| backoff_delay(num_total_retries));
            tokio::select! {
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
            current = decision.config;
        }
    }
}

fn backoff_delay(num_retries: u32) -> Duration {
    let shift = num_retries.saturating_sub(1).min(8);
    let delay = BASE_RETRY_DELAY * (1u32 << shift);
    delay.min(MAX_RETRY_DELAY)
}

pub fn filter_empty_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .cloned()
        .collect()
}

pub fn messages_token_estimate(messages: &[ChatMessage]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}
