use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;

use crate::StoreError;

pub const MAX_GIT_RETRIES: u32 = 5;
const BASE_GIT_RETRY_DELAY: Duration = Duration::from_millis(100);

const LOCK_SIGNATURES: [&str; 2] = ["index.lock", "cannot lock ref"];

/// One git working copy. All mutating operations go through
/// [`GitRepo::write_operation`]; reads run directly against what is
/// assumed to be a stable checkout.
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
}

impl GitRepo {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Initializes a repository with `main` as the default branch and a
    /// committer identity, plus an initial empty commit so branch
    /// operations have a head to fork from.
    pub async fn init(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let repo = Self::new(dir);
        tokio::fs::create_dir_all(&repo.dir).await?;
        repo.run_git("init", &["init", "-b", "main"]).await?;
        repo.run_git("config", &["config", "user.email", "server@plait.dev"])
            .await?;
        repo.run_git("config", &["config", "user.name", "Plait"])
            .await?;
        repo.run_git(
            "initial commit",
            &["commit", "--allow-empty", "-m", "plan created"],
        )
        .await?;
        Ok(repo)
    }

    /// Runs `op` up to [`MAX_GIT_RETRIES`] times. On a failure matching a
    /// lock-contention signature, stale lock artifacts are removed and the
    /// operation retried with exponential backoff; any other failure
    /// propagates immediately.
    pub async fn write_operation<F, Fut, T>(&self, label: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last_err = None;
        for attempt in 0..MAX_GIT_RETRIES {
            if attempt > 0 {
                let delay = BASE_GIT_RETRY_DELAY * (1 << (attempt - 1));
                tracing::warn!(
                    label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying git operation"
                );
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() => {
                    tracing::warn!(label, %err, "git lock contention, clearing stale locks");
                    if let Err(cleanup_err) = self.remove_stale_lock_files().await {
                        tracing::warn!(label, %cleanup_err, "error removing lock files");
                    }
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::Other(format!(
            "operation {label} failed after {MAX_GIT_RETRIES} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Removes every candidate stale lock file concurrently. Per-path
    /// errors are collected and reported together instead of failing fast,
    /// since removal of any subset may unblock the retry.
    pub async fn remove_stale_lock_files(&self) -> Result<(), StoreError> {
        let candidates = vec![
            self.dir.join(".git").join("index.lock"),
            self.dir.join(".git").join("refs").join("heads").join("HEAD.lock"),
            self.dir.join(".git").join("HEAD.lock"),
        ];

        let mut handles = Vec::with_capacity(candidates.len());
        for path in candidates {
            handles.push(tokio::spawn(remove_lock_file(path)));
        }

        let mut errs = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errs.push(err.to_string()),
                Err(join_err) => errs.push(format!("lock removal task failed: {join_err}")),
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Other(format!(
                "error removing lock files: {}",
                errs.join("; ")
            )))
        }
    }

    pub async fn add_and_commit(&self, message: &str) -> Result<(), StoreError> {
        self.write_operation("add", || async move {
            self.run_git("add", &["add", "."]).await
        })
        .await?;
        self.write_operation("commit", || async move {
            self.run_git("commit", &["commit", "-m", message]).await
        })
        .await?;
        Ok(())
    }

    pub async fn rewind_to_sha(&self, sha: &str) -> Result<(), StoreError> {
        self.write_operation("rewind", || async move {
            self.run_git("reset", &["reset", "--hard", sha]).await
        })
        .await?;
        Ok(())
    }

    pub async fn checkout_sha(&self, sha: &str) -> Result<(), StoreError> {
        self.write_operation("checkout sha", || async move {
            self.run_git("checkout", &["checkout", sha]).await
        })
        .await?;
        Ok(())
    }

    pub async fn create_branch(&self, name: &str) -> Result<(), StoreError> {
        self.write_operation("create branch", || async move {
            self.run_git("checkout -b", &["checkout", "-b", name]).await
        })
        .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<(), StoreError> {
        self.write_operation("delete branch", || async move {
            self.run_git("branch -D", &["branch", "-D", name]).await
        })
        .await?;
        Ok(())
    }

    /// Checks the branch out, creating it if it does not exist yet.
    pub async fn checkout_branch(&self, name: &str) -> Result<(), StoreError> {
        let exists = self
            .run_git(
                "show-ref",
                &["show-ref", "--verify", "--quiet", &format!("refs/heads/{name}")],
            )
            .await
            .is_ok();

        if exists {
            self.write_operation("checkout branch", || async move {
                self.run_git("checkout", &["checkout", name]).await
            })
            .await?;
        } else {
            tracing::debug!(branch = name, "branch does not exist, creating");
            self.create_branch(name).await?;
        }
        Ok(())
    }

    /// Resets staged changes and cleans untracked files. A lightweight
    /// status probe first skips the heavier operations in the usual
    /// no-changes case.
    pub async fn clear_uncommitted_changes(&self) -> Result<(), StoreError> {
        let status = self
            .run_git("status", &["status", "--porcelain"])
            .await?;
        if status.trim().is_empty() {
            return Ok(());
        }

        self.write_operation("reset", || self.run_git("reset", &["reset", "--hard"]))
            .await?;
        self.write_operation("clean", || self.run_git("clean", &["clean", "-d", "-f"]))
            .await?;
        Ok(())
    }

    pub async fn list_branches(&self) -> Result<Vec<String>, StoreError> {
        let out = self
            .run_git("branch", &["branch", "--format=%(refname:short)"])
            .await?;
        let branches: Vec<String> = out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if branches.is_empty() {
            return Ok(vec!["main".to_string()]);
        }
        Ok(branches)
    }

    pub async fn current_commit_sha(&self) -> Result<String, StoreError> {
        let out = self.run_git("rev-parse", &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    pub async fn current_branch(&self) -> Result<String, StoreError> {
        let out = self
            .run_git("branch --show-current", &["branch", "--show-current"])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Last 10 commits on a branch: display body plus the full SHAs.
    pub async fn commit_history(&self, branch: &str) -> Result<(String, Vec<String>), StoreError> {
        let body = self
            .run_git("log", &["log", branch, "--pretty=format:%h %s", "-n", "10"])
            .await?;
        let shas_out = self
            .run_git("log", &["log", branch, "--pretty=format:%H", "-n", "10"])
            .await?;
        let shas = shas_out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Ok((body, shas))
    }

    pub async fn latest_commit(&self, branch: &str) -> Result<(String, String), StoreError> {
        let sha = self
            .run_git("rev-parse", &["rev-parse", branch])
            .await?
            .trim()
            .to_string();
        let message = self
            .run_git("show", &["show", "-s", "--format=%B", &sha])
            .await?
            .trim()
            .to_string();
        Ok((sha, message))
    }

    pub async fn latest_commit_sha_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let formatted = before.format("%Y-%m-%d %H:%M:%S+0000").to_string();
        let out = self
            .run_git(
                "log --before",
                &[
                    "log",
                    "-n",
                    "1",
                    &format!("--before={formatted}"),
                    "--pretty=%H",
                ],
            )
            .await?;
        let sha = out.trim().to_string();
        if sha.is_empty() {
            return Err(StoreError::Other(format!(
                "no commits found before {formatted}"
            )));
        }
        Ok(sha)
    }

    pub async fn commit_time(&self, reference: &str) -> Result<DateTime<Utc>, StoreError> {
        let out = self
            .run_git("show", &["show", "-s", "--format=%ct", reference])
            .await?;
        let timestamp: i64 = out.trim().parse().map_err(|_| {
            StoreError::Other(format!("error parsing commit timestamp for {reference}"))
        })?;
        Utc.timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| StoreError::Other(format!("invalid commit timestamp for {reference}")))
    }

    async fn run_git(&self, op: &str, args: &[&str]) -> Result<String, StoreError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.dir)
            .args(args)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{stdout}{stderr}");
        if LOCK_SIGNATURES.iter().any(|sig| combined.contains(sig)) {
            return Err(StoreError::LockContention { output: combined });
        }
        Err(StoreError::Git {
            op: op.to_string(),
            output: combined,
        })
    }
}

async fn remove_lock_file(path: PathBuf) -> Result<(), StoreError> {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            tracing::info!(path = %path.display(), "removed stale lock file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::Io(err)),
    }
}
