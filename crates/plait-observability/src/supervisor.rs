use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A failure surfaced by a supervised background task: either a returned
/// error or a panic. Hooks and lock cleanup run on supervised tasks so a
/// failure there never affects the primary execution path.
#[derive(Debug)]
pub struct ReportedFailure {
    pub task: String,
    pub panicked: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Central sink for unexpected failures in fire-and-forget work. The
/// receiving side is typically drained by a notification collaborator;
/// if nobody is listening the failure is still logged.
#[derive(Clone)]
pub struct FailureReporter {
    tx: Arc<mpsc::UnboundedSender<ReportedFailure>>,
}

impl FailureReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportedFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn report(&self, task: &str, panicked: bool, detail: String) {
        tracing::error!(
            target: "plait.obs",
            task,
            panicked,
            detail = detail.as_str(),
            "supervised task failure"
        );
        let _ = self.tx.send(ReportedFailure {
            task: task.to_string(),
            panicked,
            detail,
            at: Utc::now(),
        });
    }

    /// Spawns `fut` detached. An `Err` return or a panic is reported to the
    /// failure channel instead of propagating to the spawner.
    pub fn spawn_supervised<F>(&self, task: &str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let reporter = self.clone();
        let name = task.to_string();
        let inner = tokio::spawn(fut);
        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => reporter.report(&name, false, format!("{err:#}")),
                Err(join_err) if join_err.is_panic() => {
                    reporter.report(&name, true, join_err.to_string());
                }
                Err(join_err) => {
                    // cancelled; nothing to report beyond the trace
                    tracing::debug!(task = name.as_str(), "supervised task cancelled: {join_err}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_returned_errors() {
        let (reporter, mut rx) = FailureReporter::new();
        reporter
            .spawn_supervised("hook.did_send", async { anyhow::bail!("boom") })
            .await
            .unwrap();
        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.task, "hook.did_send");
        assert!(!failure.panicked);
        assert!(failure.detail.contains("boom"));
    }

    #[tokio::test]
    async fn reports_panics_without_crashing_the_process() {
        let (reporter, mut rx) = FailureReporter::new();
        reporter
            .spawn_supervised("lock.cleanup", async { panic!("unexpected") })
            .await
            .unwrap();
        let failure = rx.recv().await.unwrap();
        assert!(failure.panicked);
    }

    #[tokio::test]
    async fn successful_tasks_report_nothing() {
        let (reporter, mut rx) = FailureReporter::new();
        reporter
            .spawn_supervised("hook.ok", async { Ok(()) })
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
