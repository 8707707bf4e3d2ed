use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::Level;

use plait_models::{ChatMessage, ModelGateway, ModelRoleConfig, RequestParams, StreamEvent};
use plait_observability::{emit_event, ObservabilityEvent, ProcessKind};
use plait_store::VersionedStore;
use plait_types::{BuildError, BuildInfo};

use crate::registry::ActivePlanEntry;
use crate::validate::{SyntaxValidator, ValidationOutcome};

/// Incremental fix attempts before giving up on patching and regenerating
/// the whole file.
pub const MAX_BUILD_ERROR_RETRIES: u32 = 3;

const BASE_BUILD_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Validating,
    Retrying,
    WholeFileFallback,
    Committing,
    Done,
    Failed,
}

/// One file's passage through the build state machine. Syntax-validation
/// failures and whole-file-fallback attempts are counted independently;
/// validation timeouts share the retry budget but are tracked separately
/// for diagnostics.
#[derive(Debug, Clone)]
pub struct PlanBuild {
    pub path: String,
    pub is_new_file: bool,
    pub state: BuildState,
    pub validation_retries: u32,
    pub whole_file_retries: u32,
    pub timeout_count: u32,
    pub commit_sha: Option<String>,
}

impl PlanBuild {
    fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_new_file: false,
            state: BuildState::Pending,
            validation_retries: 0,
            whole_file_retries: 0,
            timeout_count: 0,
            commit_sha: None,
        }
    }
}

/// Turns streamed per-file reply text into validated, committed edits.
/// Validation failures retry with semi-exponential backoff up to
/// [`MAX_BUILD_ERROR_RETRIES`], then fall back to regenerating the whole
/// file exactly once. Exhaustion surfaces as a finished-with-error build
/// info event, never a silent drop.
pub struct BuildEngine {
    gateway: Arc<ModelGateway>,
    store: Arc<VersionedStore>,
    validator: Arc<dyn SyntaxValidator>,
    builder_role: ModelRoleConfig,
    whole_file_role: ModelRoleConfig,
}

impl BuildEngine {
    pub fn new(
        gateway: Arc<ModelGateway>,
        store: Arc<VersionedStore>,
        validator: Arc<dyn SyntaxValidator>,
        builder_role: ModelRoleConfig,
        whole_file_role: ModelRoleConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            validator,
            builder_role,
            whole_file_role,
        }
    }

    /// Run one file through the state machine. Cancellation leaves the
    /// build where it was; every other exit is either a commit or a
    /// finished-with-error event.
    pub async fn build_file(
        &self,
        entry: &ActivePlanEntry,
        org_id: &str,
        plan_id: &str,
        branch: &str,
        path: &str,
        content: String,
    ) -> anyhow::Result<PlanBuild> {
        let mut build = PlanBuild::new(path);
        let on_disk = self.store.paths().repo_dir(org_id, plan_id).join(path);
        build.is_new_file = !tokio::fs::try_exists(&on_disk).await.unwrap_or(false);

        entry.record_build_info(BuildInfo {
            path: path.to_string(),
            finished: false,
            error: false,
        });

        let mut current = content;
        loop {
            if entry.cancel.is_cancelled() {
                return Ok(build);
            }
            build.state = BuildState::Validating;
            let outcome = self.validator.validate(path, &current).await;
            match outcome {
                ValidationOutcome::Valid => {
                    return self
                        .commit(entry, org_id, plan_id, branch, &mut build, &current)
                        .await;
                }
                ValidationOutcome::Invalid { .. } | ValidationOutcome::TimedOut => {
                    if outcome == ValidationOutcome::TimedOut {
                        build.timeout_count += 1;
                    }
                    if build.validation_retries == MAX_BUILD_ERROR_RETRIES {
                        break;
                    }
                    build.validation_retries += 1;
                    build.state = BuildState::Retrying;
                    let detail = match &outcome {
                        ValidationOutcome::Invalid { detail } => detail.clone(),
                        _ => "syntax validation timed out".to_string(),
                    };
                    emit_event(
                        Level::WARN,
                        ProcessKind::Server,
                        ObservabilityEvent {
                            plan_id: Some(plan_id),
                            branch: Some(branch),
                            status: Some("retrying"),
                            detail: Some(&detail),
                            ..ObservabilityEvent::new("build.validate.retry", "engine.build")
                        },
                    );

                    let delay =
                        BASE_BUILD_RETRY_DELAY * (1 << (build.validation_retries - 1).min(4));
                    tokio::select! {
                        _ = entry.cancel.cancelled() => return Ok(build),
                        _ = tokio::time::sleep(delay) => {}
                    }

                    match self
                        .regenerate_incremental(entry, path, &current, &detail)
                        .await
                    {
                        Ok(fixed) => current = fixed,
                        // A failed fix request burns the remaining
                        // incremental budget; go straight to whole-file.
                        Err(err) => {
                            tracing::warn!(%path, error = %err, "incremental fix request failed");
                            break;
                        }
                    }
                }
            }
        }

        // Whole-file fallback, exactly once.
        build.state = BuildState::WholeFileFallback;
        build.whole_file_retries = 1;
        let regenerated = self
            .regenerate_whole_file(entry, org_id, plan_id, path, &current, build.is_new_file)
            .await;
        if let Ok(full) = regenerated {
            if self.validator.validate(path, &full).await == ValidationOutcome::Valid {
                return self
                    .commit(entry, org_id, plan_id, branch, &mut build, &full)
                    .await;
            }
        }

        build.state = BuildState::Failed;
        entry.record_build_info(BuildInfo {
            path: path.to_string(),
            finished: true,
            error: true,
        });
        emit_event(
            Level::ERROR,
            ProcessKind::Server,
            ObservabilityEvent {
                plan_id: Some(plan_id),
                branch: Some(branch),
                status: Some("failed"),
                error_code: Some("BUILD_RETRIES_EXHAUSTED"),
                detail: Some(path),
                ..ObservabilityEvent::new("build.file.failed", "engine.build")
            },
        );
        Err(BuildError::RetriesExhausted {
            path: path.to_string(),
        }
        .into())
    }

    async fn commit(
        &self,
        entry: &ActivePlanEntry,
        org_id: &str,
        plan_id: &str,
        branch: &str,
        build: &mut PlanBuild,
        content: &str,
    ) -> anyhow::Result<PlanBuild> {
        build.state = BuildState::Committing;
        let verb = if build.is_new_file { "Create" } else { "Update" };
        let sha = self
            .store
            .commit_file(
                org_id,
                plan_id,
                branch,
                &build.path,
                content,
                &format!("{verb} {}", build.path),
            )
            .await
            .with_context(|| format!("committing {}", build.path))?;
        build.commit_sha = Some(sha);
        build.state = BuildState::Done;
        entry.record_build_info(BuildInfo {
            path: build.path.clone(),
            finished: true,
            error: false,
        });
        Ok(build.clone())
    }

    async fn regenerate_incremental(
        &self,
        entry: &ActivePlanEntry,
        path: &str,
        current: &str,
        detail: &str,
    ) -> anyhow::Result<String> {
        let messages = vec![
            ChatMessage::system(FIX_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "The generated content for `{path}` failed syntax validation:\n\n\
                 {detail}\n\n\
                 Current content:\n\n```\n{current}\n```\n\n\
                 Return the corrected full file in a single fenced code block."
            )),
        ];
        self.generate(entry, &self.builder_role, "build-fix", messages)
            .await
    }

    async fn regenerate_whole_file(
        &self,
        entry: &ActivePlanEntry,
        org_id: &str,
        plan_id: &str,
        path: &str,
        attempted: &str,
        is_new_file: bool,
    ) -> anyhow::Result<String> {
        let baseline = if is_new_file {
            String::new()
        } else {
            let on_disk = self.store.paths().repo_dir(org_id, plan_id).join(path);
            tokio::fs::read_to_string(&on_disk).await.unwrap_or_default()
        };
        let mut prompt = format!(
            "Incremental edits to `{path}` could not be validated. \
             Write out the complete, final content of the file.\n\n"
        );
        if !baseline.is_empty() {
            prompt.push_str(&format!("Original file:\n\n```\n{baseline}\n```\n\n"));
        }
        prompt.push_str(&format!(
            "Intended change (may contain errors):\n\n```\n{attempted}\n```\n\n\
             Return only the full file in a single fenced code block."
        ));
        let messages = vec![ChatMessage::system(FIX_SYSTEM_PROMPT), ChatMessage::user(prompt)];
        self.generate(entry, &self.whole_file_role, "build-whole-file", messages)
            .await
    }

    async fn generate(
        &self,
        entry: &ActivePlanEntry,
        role: &ModelRoleConfig,
        purpose: &str,
        messages: Vec<ChatMessage>,
    ) -> anyhow::Result<String> {
        let params = RequestParams::new(purpose, messages);
        let mut sink = |_event: StreamEvent<'_>| {};
        let response = self
            .gateway
            .request_with_retries(role, &params, &mut sink, &entry.cancel)
            .await?;
        Ok(extract_fenced_block(&response.content).unwrap_or(response.content))
    }
}

const FIX_SYSTEM_PROMPT: &str = "You are a code repair assistant. You are given \
file content that failed a syntax check. Respond with the corrected, complete \
file content in exactly one fenced code block and nothing else.";

/// First fenced code block in a response, without the fence lines. Falls
/// back to the caller when no fence is present.
pub fn extract_fenced_block(content: &str) -> Option<String> {
    let mut lines = content.lines();
    lines.by_ref().find(|l| l.trim_start().starts_with("```"))?;
    let mut body = String::new();
    for line in lines {
        if line.trim_start().starts_with("```") {
            return Some(body);
        }
        body.push_str(line);
        body.push('\n');
    }
    // Unterminated fence: take everything after the opening line.
    (!body.is_empty()).then_some(body)
}
