use plait_types::{ModelError, ModelErrorKind};
use serde::{Deserialize, Serialize};

/// Max fallback depth for chain traversal. Should never be reached in real
/// configurations, but protects against runaway chains or circular
/// references introduced by misconfiguration. Treated as a correctness
/// requirement, not a safety net: every traversal terminates within it.
pub const MAX_FALLBACK_DEPTH: usize = 10;

/// Retry with the same model this many times before consulting the error
/// fallback chain.
pub const MAX_RETRIES_BEFORE_FALLBACK: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ModelRole {
    Planner,
    Builder,
    WholeFileBuilder,
    Namer,
    CommitMessages,
}

impl ModelRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelRole::Planner => "planner",
            ModelRole::Builder => "builder",
            ModelRole::WholeFileBuilder => "whole-file-builder",
            ModelRole::Namer => "namer",
            ModelRole::CommitMessages => "commit-messages",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaseModelConfig {
    pub model_id: String,
    pub model_name: String,
    pub provider: String,
    /// Context window in tokens.
    pub max_tokens: u64,
    pub max_output_tokens: u64,
    pub reserved_output_tokens: u64,
    /// Accounts for tokenizer estimation error during role selection.
    pub token_estimate_padding_pct: f64,
    /// Provider lacks native stop-sequence support; the gateway applies a
    /// buffer-scanning shim instead.
    #[serde(default)]
    pub stop_disabled: bool,
    #[serde(default)]
    pub role_params_disabled: bool,
}

/// One entry in the provider preference stack for a logical model, in
/// order of preference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderOption {
    pub provider: String,
    /// Provider offers aggregated routing/fallback of its own, making it
    /// the preferred substitute when the primary provider errors.
    #[serde(default)]
    pub aggregated_routing: bool,
    /// Caller holds provider-specific subscription auth that should not be
    /// abandoned for an aggregator.
    #[serde(default)]
    pub subscription_auth: bool,
}

/// A role's model selection plus its named fallback links. The links form
/// a rooted forest per role, never a general graph; traversal is bounded
/// by [`MAX_FALLBACK_DEPTH`] regardless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoleConfig {
    pub role: ModelRole,
    pub model: BaseModelConfig,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_context_fallback: Option<Box<ModelRoleConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_output_fallback: Option<Box<ModelRoleConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_fallback: Option<Box<ModelRoleConfig>>,
    /// Optional same-role escalation to a stronger model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strong_model: Option<Box<ModelRoleConfig>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackType {
    Error,
    Context,
    Provider,
}

#[derive(Debug, Clone)]
pub struct FallbackResult {
    pub config: ModelRoleConfig,
    pub fallback: Option<FallbackType>,
}

impl FallbackResult {
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl ModelRoleConfig {
    pub fn new(role: ModelRole, model: BaseModelConfig) -> Self {
        Self {
            role,
            model,
            temperature: 0.7,
            top_p: 1.0,
            large_context_fallback: None,
            large_output_fallback: None,
            error_fallback: None,
            strong_model: None,
        }
    }

    /// Walks the large-context fallback chain while the padded input
    /// estimate exceeds the current config's context window. Stops at the
    /// first config whose budget suffices, the end of the chain, or the
    /// max depth, whichever comes first. If the estimate exceeds every
    /// model in the chain, the last one is returned.
    pub fn role_for_input_tokens(&self, input_tokens: u64) -> &ModelRoleConfig {
        let padded = pad_tokens(input_tokens, self.model.token_estimate_padding_pct);
        let mut current = self;
        let mut n = 0;
        loop {
            if current.model.max_tokens >= padded {
                return current;
            }
            match &current.large_context_fallback {
                None => return current,
                Some(next) => current = next,
            }
            n += 1;
            if n > MAX_FALLBACK_DEPTH {
                break;
            }
        }
        current
    }

    /// Same pattern over reserved output budgets, falling through to the
    /// large-context chain where no large-output fallback exists.
    pub fn role_for_output_tokens(&self, output_tokens: u64) -> &ModelRoleConfig {
        let padded = pad_tokens(output_tokens, self.model.token_estimate_padding_pct);
        let mut current = self;
        let mut n = 0;
        loop {
            if current.model.reserved_output_tokens >= padded {
                return current;
            }
            match (&current.large_output_fallback, &current.large_context_fallback) {
                (Some(next), _) => current = next,
                (None, Some(next)) => current = next,
                (None, None) => return current,
            }
            n += 1;
            if n > MAX_FALLBACK_DEPTH {
                break;
            }
        }
        current
    }

    pub fn final_large_context_fallback(&self) -> &ModelRoleConfig {
        let mut current = self;
        let mut n = 0;
        while let Some(next) = &current.large_context_fallback {
            current = next;
            n += 1;
            if n > MAX_FALLBACK_DEPTH {
                break;
            }
        }
        current
    }

    pub fn final_large_output_fallback(&self) -> &ModelRoleConfig {
        if self.large_output_fallback.is_none() {
            return self.final_large_context_fallback();
        }
        let mut current = self;
        let mut n = 0;
        while let Some(next) = &current.large_output_fallback {
            current = next;
            n += 1;
            if n > MAX_FALLBACK_DEPTH {
                break;
            }
        }
        current
    }

    /// Deterministic decision table for recovering from a classified model
    /// error:
    ///
    /// - context-too-long: large-context fallback if defined, else no change
    /// - non-retriable error, or retry count past
    ///   [`MAX_RETRIES_BEFORE_FALLBACK`]: explicit error fallback if
    ///   defined; else a one-time provider substitution
    /// - anything else: no fallback, retry as-is
    pub fn fallback_for_error(
        &self,
        num_total_retries: u32,
        did_provider_fallback: bool,
        model_err: &ModelError,
        providers: &[ProviderOption],
    ) -> FallbackResult {
        if model_err.kind == ModelErrorKind::ContextTooLong {
            if let Some(next) = &self.large_context_fallback {
                return FallbackResult {
                    config: (**next).clone(),
                    fallback: Some(FallbackType::Context),
                };
            }
        } else if !model_err.retriable || num_total_retries > MAX_RETRIES_BEFORE_FALLBACK {
            if let Some(next) = &self.error_fallback {
                return FallbackResult {
                    config: (**next).clone(),
                    fallback: Some(FallbackType::Error),
                };
            }
            if !did_provider_fallback {
                tracing::debug!(role = self.role.as_str(), "no error fallback, trying provider fallback");
                if let Some(config) = self.provider_fallback(providers) {
                    return FallbackResult {
                        config,
                        fallback: Some(FallbackType::Provider),
                    };
                }
            }
        }

        FallbackResult {
            config: self.clone(),
            fallback: None,
        }
    }

    /// A single provider substitution once the defined fallback chains are
    /// exhausted. Prefers a provider with aggregated routing of its own,
    /// unless the first provider in the stack carries subscription auth
    /// that should not be abandoned; otherwise takes the second provider.
    pub fn provider_fallback(&self, providers: &[ProviderOption]) -> Option<ModelRoleConfig> {
        if providers.len() < 2 {
            return None;
        }

        let first = &providers[0];
        let mut chosen = None;
        if !first.subscription_auth {
            chosen = providers.iter().find(|p| p.aggregated_routing);
        }
        let chosen = chosen.unwrap_or(&providers[1]);

        let mut config = self.clone();
        config.model.provider = chosen.provider.clone();
        Some(config)
    }
}

fn pad_tokens(tokens: u64, padding_pct: f64) -> u64 {
    (tokens as f64 * (1.0 + padding_pct)).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use plait_types::ModelError;

    fn base(model_id: &str, max_tokens: u64, reserved_output: u64) -> BaseModelConfig {
        BaseModelConfig {
            model_id: model_id.to_string(),
            model_name: model_id.to_string(),
            provider: "openai".to_string(),
            max_tokens,
            max_output_tokens: reserved_output,
            reserved_output_tokens: reserved_output,
            token_estimate_padding_pct: 0.0,
            stop_disabled: false,
            role_params_disabled: false,
        }
    }

    fn role(model_id: &str, max_tokens: u64) -> ModelRoleConfig {
        ModelRoleConfig::new(ModelRole::Planner, base(model_id, max_tokens, 4096))
    }

    #[test]
    fn input_selection_walks_to_a_sufficient_fallback() {
        let mut primary = role("small-8k", 8_000);
        primary.large_context_fallback = Some(Box::new(role("large-32k", 32_000)));

        let selected = primary.role_for_input_tokens(10_000);
        assert_eq!(selected.model.model_id, "large-32k");
    }

    #[test]
    fn input_selection_keeps_primary_when_budget_suffices() {
        let mut primary = role("small-8k", 8_000);
        primary.large_context_fallback = Some(Box::new(role("large-32k", 32_000)));

        let selected = primary.role_for_input_tokens(4_000);
        assert_eq!(selected.model.model_id, "small-8k");
    }

    #[test]
    fn padding_pushes_a_borderline_estimate_over() {
        let mut primary = role("small-8k", 8_000);
        primary.model.token_estimate_padding_pct = 0.1;
        primary.large_context_fallback = Some(Box::new(role("large-32k", 32_000)));

        // 7500 * 1.1 = 8250 > 8000
        let selected = primary.role_for_input_tokens(7_500);
        assert_eq!(selected.model.model_id, "large-32k");
    }

    #[test]
    fn traversal_terminates_within_depth_bound_on_a_deep_chain() {
        // chain twice as deep as the bound; every link too small
        let mut chain = role("tail", 1);
        for i in 0..(MAX_FALLBACK_DEPTH * 2) {
            let mut next = role(&format!("link-{i}"), 1);
            next.large_context_fallback = Some(Box::new(chain));
            chain = next;
        }
        // must return, not loop; the result is whatever config the bound
        // landed on
        let selected = chain.role_for_input_tokens(1_000_000);
        assert!(selected.model.max_tokens == 1);
        let last = chain.final_large_context_fallback();
        assert!(last.model.max_tokens == 1);
    }

    #[test]
    fn output_selection_falls_through_to_context_chain() {
        let mut primary = ModelRoleConfig::new(ModelRole::Builder, base("b-small", 8_000, 2_000));
        primary.large_context_fallback = Some(Box::new(ModelRoleConfig::new(
            ModelRole::Builder,
            base("b-large", 32_000, 16_000),
        )));

        let selected = primary.role_for_output_tokens(8_000);
        assert_eq!(selected.model.model_id, "b-large");
    }

    #[test]
    fn context_too_long_uses_large_context_fallback() {
        let mut primary = role("small-8k", 8_000);
        primary.large_context_fallback = Some(Box::new(role("large-32k", 32_000)));

        let err = ModelError::new(ModelErrorKind::ContextTooLong, false, "too long");
        let result = primary.fallback_for_error(0, false, &err, &[]);
        assert_eq!(result.fallback, Some(FallbackType::Context));
        assert_eq!(result.config.model.model_id, "large-32k");
    }

    #[test]
    fn retriable_error_below_threshold_retries_in_place() {
        let mut primary = role("primary", 8_000);
        primary.error_fallback = Some(Box::new(role("backup", 8_000)));

        let err = ModelError::new(ModelErrorKind::Overloaded, true, "overloaded");
        let result = primary.fallback_for_error(1, false, &err, &[]);
        assert!(result.fallback.is_none());
        assert_eq!(result.config.model.model_id, "primary");
    }

    #[test]
    fn exhausted_retries_use_error_fallback() {
        let mut primary = role("primary", 8_000);
        primary.error_fallback = Some(Box::new(role("backup", 8_000)));

        let err = ModelError::new(ModelErrorKind::Overloaded, true, "overloaded");
        let result = primary.fallback_for_error(MAX_RETRIES_BEFORE_FALLBACK + 1, false, &err, &[]);
        assert_eq!(result.fallback, Some(FallbackType::Error));
        assert_eq!(result.config.model.model_id, "backup");
    }

    #[test]
    fn non_retriable_error_goes_straight_to_fallback() {
        let mut primary = role("primary", 8_000);
        primary.error_fallback = Some(Box::new(role("backup", 8_000)));

        let err = ModelError::new(ModelErrorKind::Other, false, "bad request");
        let result = primary.fallback_for_error(0, false, &err, &[]);
        assert_eq!(result.fallback, Some(FallbackType::Error));
    }

    #[test]
    fn provider_fallback_prefers_aggregated_routing() {
        let primary = role("primary", 8_000);
        let providers = vec![
            ProviderOption {
                provider: "anthropic".to_string(),
                aggregated_routing: false,
                subscription_auth: false,
            },
            ProviderOption {
                provider: "bedrock".to_string(),
                aggregated_routing: false,
                subscription_auth: false,
            },
            ProviderOption {
                provider: "openrouter".to_string(),
                aggregated_routing: true,
                subscription_auth: false,
            },
        ];

        let err = ModelError::new(ModelErrorKind::Other, false, "bad request");
        let result = primary.fallback_for_error(0, false, &err, &providers);
        assert_eq!(result.fallback, Some(FallbackType::Provider));
        assert_eq!(result.config.model.provider, "openrouter");
    }

    #[test]
    fn subscription_auth_keeps_second_provider_over_aggregator() {
        let primary = role("primary", 8_000);
        let providers = vec![
            ProviderOption {
                provider: "anthropic".to_string(),
                aggregated_routing: false,
                subscription_auth: true,
            },
            ProviderOption {
                provider: "bedrock".to_string(),
                aggregated_routing: false,
                subscription_auth: false,
            },
            ProviderOption {
                provider: "openrouter".to_string(),
                aggregated_routing: true,
                subscription_auth: false,
            },
        ];

        let result = primary.provider_fallback(&providers).unwrap();
        assert_eq!(result.model.provider, "bedrock");
    }

    #[test]
    fn provider_fallback_needs_at_least_two_providers() {
        let primary = role("primary", 8_000);
        let providers = vec![ProviderOption {
            provider: "anthropic".to_string(),
            aggregated_routing: false,
            subscription_auth: false,
        }];
        assert!(primary.provider_fallback(&providers).is_none());

        let err = ModelError::new(ModelErrorKind::Other, false, "bad request");
        let result = primary.fallback_for_error(0, false, &err, &providers);
        assert!(result.fallback.is_none());
    }

    #[test]
    fn provider_fallback_not_repeated() {
        let primary = role("primary", 8_000);
        let providers = vec![
            ProviderOption {
                provider: "anthropic".to_string(),
                aggregated_routing: false,
                subscription_auth: false,
            },
            ProviderOption {
                provider: "bedrock".to_string(),
                aggregated_routing: false,
                subscription_auth: false,
            },
        ];

        let err = ModelError::new(ModelErrorKind::Other, false, "bad request");
        let result = primary.fallback_for_error(0, true, &err, &providers);
        assert!(result.fallback.is_none());
    }
}
