use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use plait_observability::{emit_event, ObservabilityEvent, ProcessKind};
use plait_types::{estimate_tokens, BuildInfo, ConnectActiveState, RegistryError, StreamMessage};

use crate::broadcast::{StreamBroadcaster, Subscription, HEARTBEAT_INTERVAL};

/// Caller's decision for a file section that targets a path already
/// present in the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingFileChoice {
    Skip,
    Overwrite,
}

/// In-memory, ephemeral execution state for one running (plan, branch).
/// Everything here is rebuilt from durable storage on the next activation;
/// nothing is written through.
#[derive(Debug, Clone, Default)]
pub struct ActivePlanState {
    pub prompt: String,
    pub build_only: bool,
    pub background: bool,
    pub stopped: bool,
    /// Reply text accumulated during the current step.
    pub current_reply: String,
    pub current_reply_tokens: u64,
    /// Replies from already-finished steps, oldest first.
    pub replies: Vec<String>,
    /// Set when generation referenced a file outside the plan's context and
    /// is waiting on the caller's skip/overwrite decision.
    pub missing_file_path: Option<String>,
    pub skip_paths: HashSet<String>,
    pub overwrite_paths: HashSet<String>,
    /// Latest build progress per path, replayed to late joiners.
    pub builds: HashMap<String, BuildInfo>,
}

/// One registered execution. The cancellation token is the single signal
/// observed by the model stream, the build loop, and the heartbeat task.
#[derive(Debug)]
pub struct ActivePlanEntry {
    plan_id: String,
    branch: String,
    state: Mutex<ActivePlanState>,
    pub cancel: CancellationToken,
    broadcaster: StreamBroadcaster,
    /// Woken when a missing-file decision lands.
    pub missing_file_decision: tokio::sync::Notify,
}

impl ActivePlanEntry {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ActivePlanState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> ActivePlanState {
        self.lock_state().clone()
    }

    /// Append streamed text and broadcast it in one critical section, so a
    /// subscriber registering concurrently sees either the snapshot with
    /// this chunk or the chunk itself, never both or neither.
    pub fn append_reply_chunk(&self, text: &str) {
        let mut state = self.lock_state();
        state.current_reply.push_str(text);
        state.current_reply_tokens += estimate_tokens(text);
        self.broadcaster.send(&StreamMessage::Chunk {
            content: text.to_string(),
        });
    }

    /// Discard reply text past `checkpoint`. Used when a retried model
    /// attempt restarts the step's output; subscribers that already saw the
    /// stale deltas are not rewound.
    pub fn truncate_reply_to(&self, checkpoint: usize) {
        let mut state = self.lock_state();
        state.current_reply.truncate(checkpoint);
        state.current_reply_tokens = estimate_tokens(&state.current_reply);
    }

    pub fn record_build_info(&self, info: BuildInfo) {
        let mut state = self.lock_state();
        state.builds.insert(info.path.clone(), info.clone());
        self.broadcaster.send(&StreamMessage::BuildInfo(info));
    }

    pub fn broadcast(&self, msg: &StreamMessage) {
        self.broadcaster.send(msg);
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }
}

/// Process-wide table of in-flight executions keyed by (plan, branch).
/// Single source of truth for "what is currently running"; all access goes
/// through its methods. Mutations are serialized per key and independent
/// across keys.
#[derive(Default)]
pub struct ActivePlanRegistry {
    entries: Mutex<HashMap<(String, String), Arc<ActivePlanEntry>>>,
}

impl ActivePlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), Arc<ActivePlanEntry>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new execution. At most one may exist per (plan, branch);
    /// a second start is rejected without touching the first.
    pub fn start(
        &self,
        plan_id: &str,
        branch: &str,
        initial: ActivePlanState,
    ) -> Result<Arc<ActivePlanEntry>, RegistryError> {
        let key = (plan_id.to_string(), branch.to_string());
        let mut entries = self.lock_entries();
        if entries.contains_key(&key) {
            return Err(RegistryError::AlreadyActive {
                plan_id: plan_id.to_string(),
                branch: branch.to_string(),
            });
        }
        let entry = Arc::new(ActivePlanEntry {
            plan_id: plan_id.to_string(),
            branch: branch.to_string(),
            state: Mutex::new(initial),
            cancel: CancellationToken::new(),
            broadcaster: StreamBroadcaster::new(),
            missing_file_decision: tokio::sync::Notify::new(),
        });
        entries.insert(key, entry.clone());
        drop(entries);

        spawn_heartbeat(entry.clone());

        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                plan_id: Some(plan_id),
                branch: Some(branch),
                status: Some("start"),
                ..ObservabilityEvent::new("plan.active.start", "engine.registry")
            },
        );
        Ok(entry)
    }

    /// Read-only lookup; never blocks on the stream.
    pub fn get(&self, plan_id: &str, branch: &str) -> Option<Arc<ActivePlanEntry>> {
        self.lock_entries()
            .get(&(plan_id.to_string(), branch.to_string()))
            .cloned()
    }

    /// Apply a mutation under the entry's exclusive lock. A panicking
    /// mutator is recovered: the entry is torn down with a terminal error
    /// event and the table stays usable.
    pub fn update<F>(&self, plan_id: &str, branch: &str, mutator: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut ActivePlanState),
    {
        let entry = self.get(plan_id, branch).ok_or_else(|| RegistryError::NotFound {
            plan_id: plan_id.to_string(),
            branch: branch.to_string(),
        })?;

        let outcome = {
            let mut state = entry.lock_state();
            catch_unwind(AssertUnwindSafe(|| mutator(&mut state)))
        };
        if let Err(panic) = outcome {
            let detail = panic_message(&panic);
            tracing::error!(%plan_id, %branch, %detail, "active plan mutator panicked");
            self.finish(
                plan_id,
                branch,
                StreamMessage::Error {
                    message: format!("internal error: {detail}"),
                },
            );
            return Err(RegistryError::MutatorPanicked { detail });
        }
        Ok(())
    }

    /// Attach a listener to an already-active plan. The snapshot and the
    /// registration happen under the entry's state lock, so for every
    /// prefix of the eventual output the subscriber sees exactly that
    /// prefix: the snapshot plus all later chunks.
    pub fn subscribe(
        &self,
        plan_id: &str,
        branch: &str,
    ) -> Result<Subscription, RegistryError> {
        let entry = self.get(plan_id, branch).ok_or_else(|| RegistryError::NotFound {
            plan_id: plan_id.to_string(),
            branch: branch.to_string(),
        })?;

        let state = entry.lock_state();
        let connect = ConnectActiveState {
            init_prompt: (!state.prompt.is_empty()).then(|| state.prompt.clone()),
            init_build_only: state.build_only,
            init_replies: state.replies.clone(),
            missing_file_path: state.missing_file_path.clone(),
        };
        let mut replay = vec![StreamMessage::ConnectActive(connect)];
        if !state.current_reply.is_empty() {
            replay.push(StreamMessage::Chunk {
                content: state.current_reply.clone(),
            });
        }
        let mut builds: Vec<_> = state.builds.values().cloned().collect();
        builds.sort_by(|a, b| a.path.cmp(&b.path));
        replay.extend(builds.into_iter().map(StreamMessage::BuildInfo));

        let sub = entry.broadcaster.subscribe_with_replay(replay);
        drop(state);
        Ok(sub)
    }

    /// Fresh subscription for the caller that started the plan; replays a
    /// bare `start` event instead of a connect snapshot.
    pub fn subscribe_fresh(
        &self,
        plan_id: &str,
        branch: &str,
    ) -> Result<Subscription, RegistryError> {
        let entry = self.get(plan_id, branch).ok_or_else(|| RegistryError::NotFound {
            plan_id: plan_id.to_string(),
            branch: branch.to_string(),
        })?;
        let state = entry.lock_state();
        let sub = entry
            .broadcaster
            .subscribe_with_replay(vec![StreamMessage::Start]);
        drop(state);
        Ok(sub)
    }

    /// Idempotent detach; safe after the entry itself is gone. When the
    /// last subscriber of a non-background plan detaches, the plan is
    /// stopped rather than left running for nobody.
    pub fn unsubscribe(&self, plan_id: &str, branch: &str, subscription_id: Uuid) {
        let Some(entry) = self.get(plan_id, branch) else {
            return;
        };
        entry.broadcaster.unsubscribe(subscription_id);
        let orphaned = {
            let state = entry.lock_state();
            !state.background && !state.stopped && entry.broadcaster.subscriber_count() == 0
        };
        if orphaned {
            tracing::info!(%plan_id, %branch, "last subscriber detached, stopping plan");
            let _ = self.stop(plan_id, branch);
        }
    }

    /// Cancel the execution: in-flight model calls abort, the build loop
    /// stops accepting chunks, and every subscriber receives a terminal
    /// aborted event.
    pub fn stop(&self, plan_id: &str, branch: &str) -> Result<(), RegistryError> {
        let entry = self.get(plan_id, branch).ok_or_else(|| RegistryError::NotFound {
            plan_id: plan_id.to_string(),
            branch: branch.to_string(),
        })?;
        entry.lock_state().stopped = true;
        self.finish(plan_id, branch, StreamMessage::Aborted);
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                plan_id: Some(plan_id),
                branch: Some(branch),
                status: Some("stopped"),
                ..ObservabilityEvent::new("plan.active.stop", "engine.registry")
            },
        );
        Ok(())
    }

    /// Terminal teardown: deliver `terminal` to every subscriber, cancel
    /// the entry's token, and drop it from the table.
    pub fn finish(&self, plan_id: &str, branch: &str, terminal: StreamMessage) {
        let key = (plan_id.to_string(), branch.to_string());
        let entry = self.lock_entries().remove(&key);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            entry.broadcaster.finish(&terminal);
        }
    }

    pub fn active_keys(&self) -> Vec<(String, String)> {
        self.lock_entries().keys().cloned().collect()
    }

    /// Process shutdown: abort everything still running.
    pub fn drain(&self) {
        for (plan_id, branch) in self.active_keys() {
            let _ = self.stop(&plan_id, &branch);
        }
    }
}

fn spawn_heartbeat(entry: Arc<ActivePlanEntry>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = entry.cancel.cancelled() => return,
                _ = ticker.tick() => entry.broadcast(&StreamMessage::Heartbeat),
            }
        }
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial(prompt: &str) -> ActivePlanState {
        ActivePlanState {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_corrupting_the_first() {
        let registry = ActivePlanRegistry::new();
        let entry = registry.start("p1", "main", initial("hello")).unwrap();
        entry.append_reply_chunk("partial");

        let err = registry.start("p1", "main", initial("other")).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyActive { .. }));
        assert_eq!(registry.get("p1", "main").unwrap().snapshot().prompt, "hello");
        assert_eq!(
            registry.get("p1", "main").unwrap().snapshot().current_reply,
            "partial"
        );
    }

    #[tokio::test]
    async fn independent_keys_do_not_collide() {
        let registry = ActivePlanRegistry::new();
        registry.start("p1", "main", initial("a")).unwrap();
        registry.start("p1", "feature", initial("b")).unwrap();
        registry.start("p2", "main", initial("c")).unwrap();
        assert_eq!(registry.active_keys().len(), 3);
    }

    #[tokio::test]
    async fn late_subscriber_replays_accumulated_state() {
        let registry = ActivePlanRegistry::new();
        let entry = registry.start("p1", "main", initial("prompt")).unwrap();
        entry.append_reply_chunk("first ");
        entry.append_reply_chunk("half");

        let mut sub = registry.subscribe("p1", "main").unwrap();
        entry.append_reply_chunk(" second");

        let connect = sub.events.recv().await.unwrap();
        match connect {
            StreamMessage::ConnectActive(state) => {
                assert_eq!(state.init_prompt.as_deref(), Some("prompt"));
            }
            other => panic!("expected connect snapshot, got {other:?}"),
        }
        assert_eq!(
            sub.events.recv().await,
            Some(StreamMessage::Chunk {
                content: "first half".to_string()
            })
        );
        assert_eq!(
            sub.events.recv().await,
            Some(StreamMessage::Chunk {
                content: " second".to_string()
            })
        );
    }

    #[tokio::test]
    async fn replay_prefix_matches_generated_prefix() {
        // For every point in the stream, a subscriber connecting there sees
        // exactly the text generated so far, then the remainder.
        let registry = ActivePlanRegistry::new();
        let entry = registry.start("p1", "main", initial("p")).unwrap();
        let chunks = ["alpha ", "beta ", "gamma"];
        let full: String = chunks.concat();

        for cut in 0..=chunks.len() {
            let registry2 = ActivePlanRegistry::new();
            let entry2 = registry2.start("p1", "main", initial("p")).unwrap();
            for c in &chunks[..cut] {
                entry2.append_reply_chunk(c);
            }
            let mut sub = registry2.subscribe("p1", "main").unwrap();
            for c in &chunks[cut..] {
                entry2.append_reply_chunk(c);
            }
            registry2.finish("p1", "main", StreamMessage::Done);

            let mut seen = String::new();
            while let Some(msg) = sub.events.recv().await {
                match msg {
                    StreamMessage::Chunk { content } => seen.push_str(&content),
                    StreamMessage::Done => break,
                    _ => {}
                }
            }
            assert_eq!(seen, full, "cut at {cut}");
        }
        drop(entry);
        registry.finish("p1", "main", StreamMessage::Done);
    }

    #[tokio::test]
    async fn stop_delivers_aborted_and_removes_entry() {
        let registry = ActivePlanRegistry::new();
        let entry = registry.start("p1", "main", initial("p")).unwrap();
        let mut sub = registry.subscribe("p1", "main").unwrap();

        registry.stop("p1", "main").unwrap();

        assert!(entry.cancel.is_cancelled());
        assert!(registry.get("p1", "main").is_none());
        let mut terminal = None;
        while let Some(msg) = sub.events.recv().await {
            if msg.is_terminal() {
                terminal = Some(msg);
            }
        }
        assert_eq!(terminal, Some(StreamMessage::Aborted));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_after_teardown() {
        let registry = ActivePlanRegistry::new();
        registry.start("p1", "main", initial("p")).unwrap();
        let sub = registry.subscribe("p1", "main").unwrap();
        registry.finish("p1", "main", StreamMessage::Done);
        // Entry is gone; detaching again must be a no-op.
        registry.unsubscribe("p1", "main", sub.id);
        registry.unsubscribe("p1", "main", sub.id);
    }

    #[tokio::test]
    async fn last_subscriber_detaching_stops_foreground_plan() {
        let registry = ActivePlanRegistry::new();
        registry.start("p1", "main", initial("p")).unwrap();
        let sub = registry.subscribe("p1", "main").unwrap();
        registry.unsubscribe("p1", "main", sub.id);
        assert!(registry.get("p1", "main").is_none());
    }

    #[tokio::test]
    async fn background_plan_survives_losing_all_subscribers() {
        let registry = ActivePlanRegistry::new();
        let init = ActivePlanState {
            background: true,
            ..Default::default()
        };
        registry.start("p1", "main", init).unwrap();
        let sub = registry.subscribe("p1", "main").unwrap();
        registry.unsubscribe("p1", "main", sub.id);
        assert!(registry.get("p1", "main").is_some());
        registry.finish("p1", "main", StreamMessage::Done);
    }

    #[tokio::test]
    async fn panicking_mutator_is_recovered_and_surfaced() {
        let registry = ActivePlanRegistry::new();
        registry.start("p1", "main", initial("p")).unwrap();
        let mut sub = registry.subscribe("p1", "main").unwrap();

        let err = registry
            .update("p1", "main", |_| panic!("boom"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::MutatorPanicked { .. }));
        assert!(registry.get("p1", "main").is_none());

        let mut terminal = None;
        while let Some(msg) = sub.events.recv().await {
            if msg.is_terminal() {
                terminal = Some(msg);
            }
        }
        assert!(matches!(terminal, Some(StreamMessage::Error { .. })));

        // Table still usable for the same key.
        registry.start("p1", "main", initial("again")).unwrap();
        registry.finish("p1", "main", StreamMessage::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_flow_during_silence() {
        let registry = ActivePlanRegistry::new();
        registry.start("p1", "main", initial("p")).unwrap();
        let mut sub = registry.subscribe("p1", "main").unwrap();
        sub.events.recv().await.unwrap(); // connect snapshot

        tokio::time::sleep(HEARTBEAT_INTERVAL + std::time::Duration::from_millis(100)).await;
        assert_eq!(sub.events.recv().await, Some(StreamMessage::Heartbeat));
        registry.finish("p1", "main", StreamMessage::Done);
    }

    #[tokio::test]
    async fn drain_aborts_everything() {
        let registry = ActivePlanRegistry::new();
        registry.start("p1", "main", initial("a")).unwrap();
        registry.start("p2", "main", initial("b")).unwrap();
        registry.drain();
        assert!(registry.active_keys().is_empty());
    }
}
