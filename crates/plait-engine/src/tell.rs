use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::Level;

use plait_models::{ChatMessage, ModelGateway, ModelRoleConfig, RequestParams, StreamEvent};
use plait_observability::{emit_event, ObservabilityEvent, ProcessKind};
use plait_store::VersionedStore;
use plait_types::{BranchStatus, StreamMessage};

use crate::build::BuildEngine;
use crate::registry::{ActivePlanEntry, ActivePlanRegistry, MissingFileChoice};
use crate::reply::{ReplyEvent, ReplyParser};

/// Ceiling on automatic continuation steps within one tell, so a model
/// that always stops at the output limit cannot loop forever.
pub const MAX_TELL_STEPS: u32 = 10;

const TELL_SYSTEM_PROMPT: &str = "You are a software planning assistant. When \
you change or create a file, emit a section for it: a heading line of the \
form `### path/to/file`, a blank line, then the complete new file content in \
exactly one fenced code block. Never nest fences inside a file block. Prose \
outside file sections explains the plan.";

/// Drives one conversational turn: builds the outgoing prompt, streams the
/// model's reply into the active plan, and hands finished file sections to
/// the build pipeline. Multi-step plans loop until the model stops on its
/// own or [`MAX_TELL_STEPS`] is hit.
pub struct TellEngine {
    registry: Arc<ActivePlanRegistry>,
    gateway: Arc<ModelGateway>,
    store: Arc<VersionedStore>,
    builder: Arc<BuildEngine>,
    planner_role: ModelRoleConfig,
}

impl TellEngine {
    pub fn new(
        registry: Arc<ActivePlanRegistry>,
        gateway: Arc<ModelGateway>,
        store: Arc<VersionedStore>,
        builder: Arc<BuildEngine>,
        planner_role: ModelRoleConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            store,
            builder,
            planner_role,
        }
    }

    /// Run the turn to completion and tear the active plan down with the
    /// right terminal event. A cancellation observed mid-flight means stop
    /// already delivered `aborted`; nothing more is owed to subscribers.
    pub async fn run(&self, entry: Arc<ActivePlanEntry>, org_id: &str) -> anyhow::Result<()> {
        let result = self.run_steps(&entry, org_id).await;
        self.teardown(&entry, org_id, "plan.tell.failed", "TELL_FAILED", result)
            .await
    }

    /// Build-only activation: re-parse the branch's persisted replies and
    /// run every file section through the build pipeline, without a
    /// planning request. Tears down the same way `run` does, so subscribers
    /// always get a terminal event.
    pub async fn run_build_only(
        &self,
        entry: Arc<ActivePlanEntry>,
        org_id: &str,
    ) -> anyhow::Result<()> {
        let result = self.run_build_steps(&entry, org_id).await;
        self.teardown(&entry, org_id, "plan.build.failed", "BUILD_FAILED", result)
            .await
    }

    /// Shared end-of-turn path: remove the active plan and deliver the
    /// terminal event that matches the outcome. A cancellation observed
    /// mid-flight means stop already delivered `aborted`.
    async fn teardown(
        &self,
        entry: &Arc<ActivePlanEntry>,
        org_id: &str,
        failure_event: &'static str,
        error_code: &'static str,
        result: anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let plan_id = entry.plan_id().to_string();
        let branch = entry.branch().to_string();

        match result {
            Ok(()) if entry.cancel.is_cancelled() => Ok(()),
            Ok(()) => {
                self.set_branch_status(org_id, &plan_id, &branch, BranchStatus::Finished)
                    .await;
                self.registry.finish(&plan_id, &branch, StreamMessage::Done);
                Ok(())
            }
            Err(err) if entry.cancel.is_cancelled() => {
                tracing::debug!(%plan_id, %branch, error = %err, "turn ended by cancellation");
                Ok(())
            }
            Err(err) => {
                emit_event(
                    Level::ERROR,
                    ProcessKind::Server,
                    ObservabilityEvent {
                        plan_id: Some(&plan_id),
                        branch: Some(&branch),
                        status: Some("failed"),
                        error_code: Some(error_code),
                        detail: Some(&err.to_string()),
                        ..ObservabilityEvent::new(failure_event, "engine.tell")
                    },
                );
                self.registry.finish(
                    &plan_id,
                    &branch,
                    StreamMessage::Error {
                        message: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    async fn run_build_steps(
        &self,
        entry: &Arc<ActivePlanEntry>,
        org_id: &str,
    ) -> anyhow::Result<()> {
        let plan_id = entry.plan_id().to_string();
        let branch = entry.branch().to_string();

        let replies = self.load_replies(org_id, &plan_id, &branch).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = self.spawn_build_worker(entry.clone(), org_id, rx);
        for reply in replies {
            let mut parser = ReplyParser::new();
            let mut events = parser.push(&reply);
            events.extend(parser.finish());
            for event in events {
                let _ = tx.send(event);
            }
        }
        drop(tx);
        worker.await.context("build worker")?;
        Ok(())
    }

    async fn run_steps(&self, entry: &Arc<ActivePlanEntry>, org_id: &str) -> anyhow::Result<()> {
        let plan_id = entry.plan_id().to_string();
        let branch = entry.branch().to_string();

        let mut step: u32 = 0;
        loop {
            step += 1;
            let messages = self.step_messages(entry, step);

            let (tx, rx) = mpsc::unbounded_channel();
            let worker = self.spawn_build_worker(entry.clone(), org_id, rx);

            let checkpoint = entry.snapshot().current_reply.len();
            let mut parser = ReplyParser::new();
            let mut sink = |event: StreamEvent<'_>| match event {
                StreamEvent::AttemptStarted { attempt, .. } => {
                    // A retried attempt restarts the step's output. State
                    // rolls back to the checkpoint; subscribers keep any
                    // stale deltas they already saw.
                    if attempt > 1 {
                        entry.truncate_reply_to(checkpoint);
                        parser = ReplyParser::new();
                    }
                }
                StreamEvent::Delta(text) => {
                    entry.append_reply_chunk(text);
                    for ev in parser.push(text) {
                        let _ = tx.send(ev);
                    }
                }
            };

            let params = RequestParams::new("tell-plan", messages);
            let response = self
                .gateway
                .request_with_retries(&self.planner_role, &params, &mut sink, &entry.cancel)
                .await;

            let response = match response {
                Ok(res) => res,
                Err(err) => {
                    drop(tx);
                    let _ = worker.await;
                    return Err(err).context("planning request");
                }
            };
            for ev in parser.finish() {
                let _ = tx.send(ev);
            }
            drop(tx);
            worker.await.context("build worker")?;

            if entry.cancel.is_cancelled() {
                anyhow::bail!("cancelled");
            }

            // Seal the step: move the accumulated reply into history and
            // persist it so a build-only activation can replay it.
            let mut sealed = String::new();
            let _ = self.registry.update(&plan_id, &branch, |state| {
                sealed = std::mem::take(&mut state.current_reply);
                state.current_reply_tokens = 0;
                state.replies.push(sealed.clone());
            });
            let index = entry.snapshot().replies.len();
            self.save_reply(org_id, &plan_id, &branch, index, &sealed)
                .await?;
            self.record_usage(org_id, &plan_id, &branch, response.usage.output_tokens)
                .await;

            if response.finish_reason != "length" || step >= MAX_TELL_STEPS {
                return Ok(());
            }
            tracing::info!(%plan_id, %branch, step, "output limit hit, continuing plan");
        }
    }

    fn step_messages(&self, entry: &ActivePlanEntry, step: u32) -> Vec<ChatMessage> {
        let state = entry.snapshot();
        let mut messages = vec![
            ChatMessage::system(TELL_SYSTEM_PROMPT),
            ChatMessage::user(state.prompt.clone()),
        ];
        for reply in &state.replies {
            messages.push(ChatMessage::assistant(reply.clone()));
        }
        if step > 1 {
            messages.push(ChatMessage::user(
                "Continue exactly where you left off. Do not repeat content already sent.",
            ));
        }
        messages
    }

    fn spawn_build_worker(
        &self,
        entry: Arc<ActivePlanEntry>,
        org_id: &str,
        mut rx: mpsc::UnboundedReceiver<ReplyEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let builder = self.builder.clone();
        let registry = self.registry.clone();
        let store = self.store.clone();
        let org_id = org_id.to_string();
        tokio::spawn(async move {
            let plan_id = entry.plan_id().to_string();
            let branch = entry.branch().to_string();
            while let Some(event) = rx.recv().await {
                if entry.cancel.is_cancelled() {
                    return;
                }
                match event {
                    ReplyEvent::FileStarted { path } => {
                        wait_for_file_decision(&registry, &store, &entry, &org_id, &path).await;
                    }
                    ReplyEvent::FileContent { .. } => {}
                    ReplyEvent::FileFinished { path, content } => {
                        if entry.snapshot().skip_paths.contains(&path) {
                            tracing::info!(%plan_id, %path, "skipping file per caller decision");
                            continue;
                        }
                        // Failures already surfaced as finished-with-error
                        // build info; they do not abort the turn.
                        if let Err(err) = builder
                            .build_file(&entry, &org_id, &plan_id, &branch, &path, content)
                            .await
                        {
                            tracing::warn!(%plan_id, %branch, %path, error = %err, "file build failed");
                        }
                    }
                }
            }
        })
    }

    async fn save_reply(
        &self,
        org_id: &str,
        plan_id: &str,
        branch: &str,
        index: usize,
        reply: &str,
    ) -> anyhow::Result<()> {
        let dir = self.store.paths().branch_convo_dir(org_id, plan_id, branch);
        tokio::fs::create_dir_all(&dir).await?;
        let file = dir.join(format!("{index:04}.md"));
        tokio::fs::write(&file, reply)
            .await
            .with_context(|| format!("persisting reply {index}"))?;
        Ok(())
    }

    async fn load_replies(
        &self,
        org_id: &str,
        plan_id: &str,
        branch: &str,
    ) -> anyhow::Result<Vec<String>> {
        let dir = self.store.paths().branch_convo_dir(org_id, plan_id, branch);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(e) = entries.next_entry().await? {
            names.push(e.path());
        }
        names.sort();
        let mut replies = Vec::new();
        for path in names {
            replies.push(tokio::fs::read_to_string(&path).await?);
        }
        Ok(replies)
    }

    /// Metadata only; a failed status write never masks the turn's outcome.
    async fn set_branch_status(
        &self,
        org_id: &str,
        plan_id: &str,
        branch: &str,
        status: BranchStatus,
    ) {
        let Ok(mut record) = self.store.get_branch(org_id, plan_id, branch).await else {
            return;
        };
        record.status = status;
        if let Err(err) = self.store.update_branch(org_id, plan_id, record).await {
            tracing::warn!(%plan_id, %branch, error = %err, "branch status update failed");
        }
    }

    /// Accounting only; a failed metadata write never aborts the turn.
    async fn record_usage(&self, org_id: &str, plan_id: &str, branch: &str, output_tokens: u64) {
        let loaded = self.store.get_branch(org_id, plan_id, branch).await;
        let Ok(mut record) = loaded else {
            return;
        };
        record.convo_tokens += output_tokens;
        if let Err(err) = self.store.update_branch(org_id, plan_id, record).await {
            tracing::warn!(%plan_id, %branch, error = %err, "branch usage update failed");
        }
    }
}

/// A section targeting a file that already exists in the working copy but
/// has no caller decision yet pauses the build side until the caller picks
/// skip or overwrite. The model stream itself keeps flowing.
async fn wait_for_file_decision(
    registry: &ActivePlanRegistry,
    store: &VersionedStore,
    entry: &ActivePlanEntry,
    org_id: &str,
    path: &str,
) {
    let on_disk = store.paths().repo_dir(org_id, entry.plan_id()).join(path);
    if !tokio::fs::try_exists(&on_disk).await.unwrap_or(false) {
        return;
    }
    {
        let state = entry.snapshot();
        if state.skip_paths.contains(path) || state.overwrite_paths.contains(path) {
            return;
        }
    }
    let plan_id = entry.plan_id().to_string();
    let branch = entry.branch().to_string();
    let _ = registry.update(&plan_id, &branch, |state| {
        state.missing_file_path = Some(path.to_string());
    });
    tracing::info!(%plan_id, %branch, %path, "pausing build for missing-file decision");
    loop {
        let notified = entry.missing_file_decision.notified();
        let state = entry.snapshot();
        if state.skip_paths.contains(path) || state.overwrite_paths.contains(path) {
            return;
        }
        tokio::select! {
            _ = entry.cancel.cancelled() => return,
            _ = notified => {}
        }
    }
}

/// Record the caller's decision for a paused file and wake the build side.
pub fn resolve_missing_file(
    registry: &ActivePlanRegistry,
    plan_id: &str,
    branch: &str,
    path: &str,
    choice: MissingFileChoice,
) -> Result<(), plait_types::RegistryError> {
    registry.update(plan_id, branch, |state| {
        match choice {
            MissingFileChoice::Skip => state.skip_paths.insert(path.to_string()),
            MissingFileChoice::Overwrite => state.overwrite_paths.insert(path.to_string()),
        };
        if state.missing_file_path.as_deref() == Some(path) {
            state.missing_file_path = None;
        }
    })?;
    if let Some(entry) = registry.get(plan_id, branch) {
        entry.missing_file_decision.notify_waiters();
    }
    Ok(())
}
