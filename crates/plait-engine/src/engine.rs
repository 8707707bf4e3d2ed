use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use plait_models::{ModelGateway, ModelRole, ModelRoleConfig};
use plait_observability::FailureReporter;
use plait_store::VersionedStore;
use plait_types::{BranchStatus, RegistryError};

use crate::broadcast::Subscription;
use crate::build::BuildEngine;
use crate::registry::{ActivePlanRegistry, ActivePlanState, MissingFileChoice};
use crate::tell::{resolve_missing_file, TellEngine};
use crate::validate::{SyntaxValidator, TreeSitterValidator};

/// Identity resolved by the auth collaborator before any tell, build, or
/// stream call.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub org_id: String,
    pub user_id: String,
}

#[async_trait]
pub trait AuthResolver: Send + Sync {
    async fn resolve_auth(&self) -> anyhow::Result<AuthContext>;
}

/// Fire-and-forget organizational event. Failures are logged by the
/// supervisor, never surfaced into the pipeline.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub kind: &'static str,
    pub plan_id: String,
    pub branch: String,
    pub detail: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent) -> anyhow::Result<()>;
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: NotifyEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Role table: one fallback-configured model per logical role.
#[derive(Clone, Default)]
pub struct ModelSettings {
    roles: HashMap<ModelRole, ModelRoleConfig>,
}

impl ModelSettings {
    pub fn with_role(mut self, config: ModelRoleConfig) -> Self {
        self.roles.insert(config.role, config);
        self
    }

    pub fn role(&self, role: ModelRole) -> anyhow::Result<&ModelRoleConfig> {
        self.roles
            .get(&role)
            .ok_or_else(|| anyhow::anyhow!("no model configured for role {}", role.as_str()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TellRequest {
    pub prompt: String,
    pub background: bool,
}

/// Top-level service object wiring the registry, gateway, store, and the
/// tell/build engines together. HTTP routing and presentation live outside
/// and drive this surface.
pub struct PlaitEngine {
    registry: Arc<ActivePlanRegistry>,
    store: Arc<VersionedStore>,
    tell: Arc<TellEngine>,
    auth: Arc<dyn AuthResolver>,
    notifier: Arc<dyn Notifier>,
    reporter: FailureReporter,
}

impl PlaitEngine {
    pub fn new(
        gateway: Arc<ModelGateway>,
        store: Arc<VersionedStore>,
        settings: &ModelSettings,
        auth: Arc<dyn AuthResolver>,
        notifier: Arc<dyn Notifier>,
        reporter: FailureReporter,
    ) -> anyhow::Result<Self> {
        Self::with_validator(
            gateway,
            store,
            settings,
            auth,
            notifier,
            reporter,
            Arc::new(TreeSitterValidator::default()),
        )
    }

    pub fn with_validator(
        gateway: Arc<ModelGateway>,
        store: Arc<VersionedStore>,
        settings: &ModelSettings,
        auth: Arc<dyn AuthResolver>,
        notifier: Arc<dyn Notifier>,
        reporter: FailureReporter,
        validator: Arc<dyn SyntaxValidator>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(ActivePlanRegistry::new());
        let builder = Arc::new(BuildEngine::new(
            gateway.clone(),
            store.clone(),
            validator,
            settings.role(ModelRole::Builder)?.clone(),
            settings.role(ModelRole::WholeFileBuilder)?.clone(),
        ));
        let tell = Arc::new(TellEngine::new(
            registry.clone(),
            gateway,
            store.clone(),
            builder,
            settings.role(ModelRole::Planner)?.clone(),
        ));
        Ok(Self {
            registry,
            store,
            tell,
            auth,
            notifier,
            reporter,
        })
    }

    pub fn registry(&self) -> &Arc<ActivePlanRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    /// Begin a conversational turn. The returned subscription starts with a
    /// `start` event; the execution itself runs as a supervised task.
    pub async fn start_tell(
        &self,
        plan_id: &str,
        branch: &str,
        request: TellRequest,
    ) -> anyhow::Result<Subscription> {
        let auth = self.auth.resolve_auth().await?;
        let initial = ActivePlanState {
            prompt: request.prompt,
            background: request.background,
            ..Default::default()
        };
        let entry = self.registry.start(plan_id, branch, initial)?;
        let sub = self.registry.subscribe_fresh(plan_id, branch)?;

        self.send_notification("plan.tell.started", plan_id, branch, None);
        let tell = self.tell.clone();
        let org_id = auth.org_id;
        self.reporter
            .spawn_supervised("tell", async move { tell.run(entry, &org_id).await });
        Ok(sub)
    }

    /// Begin a build-only activation: replay the branch's persisted replies
    /// through the build pipeline without a planning request.
    pub async fn start_build(
        &self,
        plan_id: &str,
        branch: &str,
        background: bool,
    ) -> anyhow::Result<Subscription> {
        let auth = self.auth.resolve_auth().await?;
        let initial = ActivePlanState {
            build_only: true,
            background,
            ..Default::default()
        };
        let entry = self.registry.start(plan_id, branch, initial)?;
        let sub = self.registry.subscribe_fresh(plan_id, branch)?;

        self.send_notification("plan.build.started", plan_id, branch, None);
        let tell = self.tell.clone();
        let org_id = auth.org_id;
        self.reporter
            .spawn_supervised("build", async move { tell.run_build_only(entry, &org_id).await });
        Ok(sub)
    }

    /// Attach to an already-active plan, replaying accumulated state first.
    pub async fn connect(&self, plan_id: &str, branch: &str) -> anyhow::Result<Subscription> {
        self.auth.resolve_auth().await?;
        Ok(self.registry.subscribe(plan_id, branch)?)
    }

    pub async fn stop(&self, plan_id: &str, branch: &str) -> anyhow::Result<()> {
        let auth = self.auth.resolve_auth().await?;
        self.registry.stop(plan_id, branch)?;
        if let Ok(mut record) = self.store.get_branch(&auth.org_id, plan_id, branch).await {
            record.status = BranchStatus::Stopped;
            if let Err(err) = self.store.update_branch(&auth.org_id, plan_id, record).await {
                tracing::warn!(%plan_id, %branch, error = %err, "branch status update failed");
            }
        }
        self.send_notification("plan.stopped", plan_id, branch, None);
        Ok(())
    }

    pub fn resolve_missing_file(
        &self,
        plan_id: &str,
        branch: &str,
        path: &str,
        choice: MissingFileChoice,
    ) -> Result<(), RegistryError> {
        resolve_missing_file(&self.registry, plan_id, branch, path, choice)
    }

    /// Process shutdown hook: abort every remaining execution.
    pub fn shutdown(&self) {
        self.registry.drain();
    }

    fn send_notification(
        &self,
        kind: &'static str,
        plan_id: &str,
        branch: &str,
        detail: Option<String>,
    ) {
        let notifier = self.notifier.clone();
        let event = NotifyEvent {
            kind,
            plan_id: plan_id.to_string(),
            branch: branch.to_string(),
            detail,
        };
        self.reporter
            .spawn_supervised("notify", async move { notifier.notify(event).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use futures::StreamExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use plait_models::{
        BaseModelConfig, ChunkStream, CompletionRequest, ModelClient, NoopHooks, ProviderOption,
        StreamChunk,
    };
    use plait_types::{ModelError, Plan, StreamMessage, TokenUsage};

    use crate::broadcast::HEARTBEAT_INTERVAL;

    struct StaticAuth;

    #[async_trait]
    impl AuthResolver for StaticAuth {
        async fn resolve_auth(&self) -> anyhow::Result<AuthContext> {
            Ok(AuthContext {
                org_id: "org1".to_string(),
                user_id: "user1".to_string(),
            })
        }
    }

    /// Streams slowly forever until cancelled.
    struct DrippingClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelClient for DrippingClient {
        async fn stream(
            &self,
            _req: CompletionRequest,
            cancel: CancellationToken,
        ) -> Result<ChunkStream, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let stream = async_stream::stream! {
                loop {
                    if cancel.is_cancelled() {
                        yield Ok(StreamChunk::Done {
                            finish_reason: "stop".to_string(),
                            usage: Some(TokenUsage::default()),
                        });
                        return;
                    }
                    yield Ok(StreamChunk::TextDelta("tick ".to_string()));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            };
            Ok(stream.boxed())
        }
    }

    fn settings() -> ModelSettings {
        let base = BaseModelConfig {
            model_id: "m1".to_string(),
            model_name: "model-one".to_string(),
            provider: "prov-a".to_string(),
            max_tokens: 100_000,
            max_output_tokens: 8_192,
            reserved_output_tokens: 8_192,
            token_estimate_padding_pct: 0.0,
            stop_disabled: false,
            role_params_disabled: false,
        };
        ModelSettings::default()
            .with_role(ModelRoleConfig::new(plait_models::ModelRole::Planner, base.clone()))
            .with_role(ModelRoleConfig::new(plait_models::ModelRole::Builder, base.clone()))
            .with_role(ModelRoleConfig::new(
                plait_models::ModelRole::WholeFileBuilder,
                base,
            ))
    }

    async fn engine_with_plan() -> (TempDir, PlaitEngine, Plan) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(VersionedStore::new(dir.path()));
        let plan = Plan::new("org1", "user1", "p");
        store.create_plan(&plan).await.unwrap();

        let (reporter, _rx) = FailureReporter::new();
        let gateway = Arc::new(ModelGateway::new(
            Arc::new(DrippingClient {
                calls: AtomicU32::new(0),
            }),
            Arc::new(NoopHooks),
            vec![ProviderOption {
                provider: "prov-a".to_string(),
                aggregated_routing: false,
                subscription_auth: false,
            }],
            reporter.clone(),
        ));
        let engine = PlaitEngine::new(
            gateway,
            store,
            &settings(),
            Arc::new(StaticAuth),
            Arc::new(NoopNotifier),
            reporter,
        )
        .unwrap();
        (dir, engine, plan)
    }

    #[tokio::test]
    async fn second_start_fails_with_already_active() {
        let (_dir, engine, plan) = engine_with_plan().await;
        let _sub = engine
            .start_tell(&plan.id, "main", TellRequest::default())
            .await
            .unwrap();

        let err = engine
            .start_tell(&plan.id, "main", TellRequest::default())
            .await
            .unwrap_err();
        let registry_err = err.downcast_ref::<RegistryError>().unwrap();
        assert!(matches!(registry_err, RegistryError::AlreadyActive { .. }));

        engine.shutdown();
    }

    #[tokio::test]
    async fn stop_mid_stream_aborts_within_a_heartbeat() {
        let (_dir, engine, plan) = engine_with_plan().await;
        let mut sub = engine
            .start_tell(&plan.id, "main", TellRequest::default())
            .await
            .unwrap();

        // Let some output flow first.
        loop {
            match sub.events.recv().await.unwrap() {
                StreamMessage::Chunk { .. } => break,
                _ => {}
            }
        }
        engine.stop(&plan.id, "main").await.unwrap();

        let deadline = tokio::time::timeout(HEARTBEAT_INTERVAL, async {
            loop {
                match sub.events.recv().await {
                    Some(msg) if msg.is_terminal() => return msg,
                    Some(_) => {}
                    None => panic!("channel closed without terminal event"),
                }
            }
        })
        .await;
        assert_eq!(deadline.unwrap(), StreamMessage::Aborted);
        assert!(engine.registry().get(&plan.id, "main").is_none());

        let branch = engine
            .store()
            .get_branch("org1", &plan.id, "main")
            .await
            .unwrap();
        assert_eq!(branch.status, BranchStatus::Stopped);
    }

    #[tokio::test]
    async fn connect_to_inactive_plan_is_not_found() {
        let (_dir, engine, plan) = engine_with_plan().await;
        let err = engine.connect(&plan.id, "main").await.unwrap_err();
        let registry_err = err.downcast_ref::<RegistryError>().unwrap();
        assert!(matches!(registry_err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_role_is_a_setup_error() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(VersionedStore::new(dir.path()));
        let (reporter, _rx) = FailureReporter::new();
        let gateway = Arc::new(ModelGateway::new(
            Arc::new(DrippingClient {
                calls: AtomicU32::new(0),
            }),
            Arc::new(NoopHooks),
            Vec::new(),
            reporter.clone(),
        ));
        let result = PlaitEngine::new(
            gateway,
            store,
            &ModelSettings::default(),
            Arc::new(StaticAuth),
            Arc::new(NoopNotifier),
            reporter,
        );
        assert!(result.is_err());
    }
}
