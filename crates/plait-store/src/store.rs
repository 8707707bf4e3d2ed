use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use plait_types::{Branch, BranchStatus, Plan, DEFAULT_BRANCH};

use crate::error::StoreError;
use crate::git::GitRepo;
use crate::paths::StorePaths;

/// Git-backed plan storage. One repository per plan; branch isolation comes
/// from git branches plus per-branch artifact directories. Writes to a given
/// plan are serialized through a per-plan mutex so concurrent operations
/// never interleave git mutations against the same working copy.
///
/// Invariant: a branch's git ref and its metadata record in `branches.json`
/// are created and destroyed together. A failure partway through rolls back
/// the half that already happened.
pub struct VersionedStore {
    paths: StorePaths,
    plan_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl VersionedStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            paths: StorePaths::new(root),
            plan_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// One lock per (org, plan), created lazily and shared by every caller
    /// touching that plan.
    async fn plan_lock(&self, org_id: &str, plan_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.plan_locks.lock().await;
        locks
            .entry((org_id.to_string(), plan_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create the plan's directory tree, initialize its repository, and
    /// record the implicit `main` branch.
    pub async fn create_plan(&self, plan: &Plan) -> Result<Branch, StoreError> {
        let lock = self.plan_lock(&plan.org_id, &plan.id).await;
        let _guard = lock.lock().await;

        let repo_dir = self.paths.repo_dir(&plan.org_id, &plan.id);
        tokio::fs::create_dir_all(&repo_dir).await?;
        tokio::fs::create_dir_all(self.paths.context_dir(&plan.org_id, &plan.id)).await?;

        GitRepo::init(&repo_dir).await?;

        let mut main = Branch::new(&plan.id, DEFAULT_BRANCH, None);
        main.status = BranchStatus::Active;
        self.create_branch_dirs(&plan.org_id, &plan.id, DEFAULT_BRANCH)
            .await?;
        self.save_branches(&plan.org_id, &plan.id, &[main.clone()])
            .await?;

        tracing::info!(plan_id = %plan.id, org_id = %plan.org_id, "created plan storage");
        Ok(main)
    }

    pub fn repo(&self, org_id: &str, plan_id: &str) -> GitRepo {
        GitRepo::new(self.paths.repo_dir(org_id, plan_id))
    }

    /// Fork a branch from the current head of `parent`. The git branch and
    /// the metadata record land together; if recording metadata fails the
    /// fresh git branch is deleted again.
    pub async fn create_branch(
        &self,
        org_id: &str,
        plan_id: &str,
        parent_name: &str,
        name: &str,
    ) -> Result<Branch, StoreError> {
        let lock = self.plan_lock(org_id, plan_id).await;
        let _guard = lock.lock().await;

        let mut branches = self.load_branches(org_id, plan_id).await?;
        let parent = branches
            .iter()
            .find(|b| b.name == parent_name)
            .ok_or_else(|| StoreError::BranchNotFound {
                plan_id: plan_id.to_string(),
                branch: parent_name.to_string(),
            })?
            .clone();
        if branches.iter().any(|b| b.name == name) {
            return Err(StoreError::Other(format!(
                "branch {name} already exists for plan {plan_id}"
            )));
        }

        let repo = self.repo(org_id, plan_id);
        repo.checkout_branch(parent_name).await?;
        repo.create_branch(name).await?;

        let branch = Branch::new(plan_id, name, Some(&parent));
        branches.push(branch.clone());

        if let Err(err) = self.create_branch_dirs(org_id, plan_id, name).await {
            let _ = repo.checkout_branch(parent_name).await;
            let _ = repo.delete_branch(name).await;
            return Err(err);
        }
        if let Err(err) = self.save_branches(org_id, plan_id, &branches).await {
            let _ = repo.checkout_branch(parent_name).await;
            let _ = repo.delete_branch(name).await;
            return Err(err);
        }

        tracing::info!(%plan_id, branch = %name, parent = %parent_name, "created branch");
        Ok(branch)
    }

    /// Remove a branch's git ref, metadata record, and artifact directory.
    /// The default branch cannot be deleted.
    pub async fn delete_branch(
        &self,
        org_id: &str,
        plan_id: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        if name == DEFAULT_BRANCH {
            return Err(StoreError::Other(format!(
                "cannot delete the {DEFAULT_BRANCH} branch"
            )));
        }
        let lock = self.plan_lock(org_id, plan_id).await;
        let _guard = lock.lock().await;

        let mut branches = self.load_branches(org_id, plan_id).await?;
        let idx = branches.iter().position(|b| b.name == name).ok_or_else(|| {
            StoreError::BranchNotFound {
                plan_id: plan_id.to_string(),
                branch: name.to_string(),
            }
        })?;

        let repo = self.repo(org_id, plan_id);
        if repo.current_branch().await? == name {
            repo.checkout_branch(DEFAULT_BRANCH).await?;
        }
        repo.delete_branch(name).await?;

        branches.remove(idx);
        self.save_branches(org_id, plan_id, &branches).await?;

        let dir = self.paths.branch_dir(org_id, plan_id, name);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }

        tracing::info!(%plan_id, branch = %name, "deleted branch");
        Ok(())
    }

    /// Branches with both a metadata record and a live git ref. A record
    /// whose ref is gone (or vice versa) is treated as not existing.
    pub async fn list_branches(
        &self,
        org_id: &str,
        plan_id: &str,
    ) -> Result<Vec<Branch>, StoreError> {
        let records = self.load_branches(org_id, plan_id).await?;
        let refs = self.repo(org_id, plan_id).list_branches().await?;
        Ok(records
            .into_iter()
            .filter(|b| refs.iter().any(|r| r == &b.name))
            .collect())
    }

    pub async fn get_branch(
        &self,
        org_id: &str,
        plan_id: &str,
        name: &str,
    ) -> Result<Branch, StoreError> {
        self.list_branches(org_id, plan_id)
            .await?
            .into_iter()
            .find(|b| b.name == name)
            .ok_or_else(|| StoreError::BranchNotFound {
                plan_id: plan_id.to_string(),
                branch: name.to_string(),
            })
    }

    pub async fn update_branch(
        &self,
        org_id: &str,
        plan_id: &str,
        branch: Branch,
    ) -> Result<(), StoreError> {
        let lock = self.plan_lock(org_id, plan_id).await;
        let _guard = lock.lock().await;

        let mut branches = self.load_branches(org_id, plan_id).await?;
        let slot = branches
            .iter_mut()
            .find(|b| b.id == branch.id)
            .ok_or_else(|| StoreError::BranchNotFound {
                plan_id: plan_id.to_string(),
                branch: branch.name.clone(),
            })?;
        *slot = Branch {
            updated_at: Utc::now(),
            ..branch
        };
        self.save_branches(org_id, plan_id, &branches).await
    }

    /// Write one file into the branch's working copy and commit it. Returns
    /// the new head SHA.
    pub async fn commit_file(
        &self,
        org_id: &str,
        plan_id: &str,
        branch: &str,
        rel_path: &str,
        content: &str,
        message: &str,
    ) -> Result<String, StoreError> {
        let lock = self.plan_lock(org_id, plan_id).await;
        let _guard = lock.lock().await;

        let repo = self.repo(org_id, plan_id);
        repo.checkout_branch(branch).await?;

        let file_path = self.paths.repo_dir(org_id, plan_id).join(rel_path);
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file_path, content).await?;

        repo.add_and_commit(message).await?;
        repo.current_commit_sha().await
    }

    /// Rewind a branch's working copy to an earlier commit, discarding
    /// anything newer. The caller decides which SHA; the store only enforces
    /// that the branch exists.
    pub async fn rewind(
        &self,
        org_id: &str,
        plan_id: &str,
        branch: &str,
        sha: &str,
    ) -> Result<(), StoreError> {
        let lock = self.plan_lock(org_id, plan_id).await;
        let _guard = lock.lock().await;

        self.get_branch_record(org_id, plan_id, branch).await?;
        let repo = self.repo(org_id, plan_id);
        repo.checkout_branch(branch).await?;
        repo.rewind_to_sha(sha).await
    }

    /// Drop uncommitted changes left behind by an interrupted build so the
    /// next activation starts from the last committed state.
    pub async fn discard_uncommitted(
        &self,
        org_id: &str,
        plan_id: &str,
        branch: &str,
    ) -> Result<(), StoreError> {
        let lock = self.plan_lock(org_id, plan_id).await;
        let _guard = lock.lock().await;

        let repo = self.repo(org_id, plan_id);
        repo.checkout_branch(branch).await?;
        repo.clear_uncommitted_changes().await
    }

    async fn get_branch_record(
        &self,
        org_id: &str,
        plan_id: &str,
        name: &str,
    ) -> Result<Branch, StoreError> {
        self.load_branches(org_id, plan_id)
            .await?
            .into_iter()
            .find(|b| b.name == name)
            .ok_or_else(|| StoreError::BranchNotFound {
                plan_id: plan_id.to_string(),
                branch: name.to_string(),
            })
    }

    async fn create_branch_dirs(
        &self,
        org_id: &str,
        plan_id: &str,
        branch: &str,
    ) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(self.paths.branch_convo_dir(org_id, plan_id, branch)).await?;
        tokio::fs::create_dir_all(self.paths.branch_builds_dir(org_id, plan_id, branch)).await?;
        Ok(())
    }

    async fn load_branches(&self, org_id: &str, plan_id: &str) -> Result<Vec<Branch>, StoreError> {
        let file = self.paths.branches_file(org_id, plan_id);
        if !tokio::fs::try_exists(&file).await? {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&file).await?;
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Other(format!("corrupt branches file for {plan_id}: {e}")))
    }

    async fn save_branches(
        &self,
        org_id: &str,
        plan_id: &str,
        branches: &[Branch],
    ) -> Result<(), StoreError> {
        let file = self.paths.branches_file(org_id, plan_id);
        let raw = serde_json::to_string_pretty(branches)
            .map_err(|e| StoreError::Other(format!("serialize branches: {e}")))?;
        // Write-then-rename so a crash mid-write never leaves a torn file.
        let tmp = file.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &file).await?;
        Ok(())
    }
}
