//! Ownership of the long-running tasks of a binary.
//!
//! Every task receives the same shutdown signal. `shutdown` flips the
//! signal and waits for each task to return, so loops finish the batch
//! they are on instead of being aborted mid-transaction.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Error returned by a supervised task.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

pub type TaskResult = Result<(), TaskError>;

/// How the supervised tasks ended.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Spawns named tasks sharing one shutdown signal.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<(String, TaskResult)>,
    report: ShutdownReport,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: JoinSet::new(),
            report: ShutdownReport::default(),
        }
    }

    /// A receiver for the shared shutdown signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Spawn `task`, handing it the shutdown signal.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let name = name.into();
        let fut = task(self.shutdown.subscribe());
        info!(task = %name, "Starting task");
        self.tasks.spawn(async move { (name, fut.await) });
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait until a task fails and return its name.
    ///
    /// Tasks that return `Ok` are recorded and waited past. Returns `None`
    /// once every task has ended without failing. The remaining tasks keep
    /// running either way.
    pub async fn wait_any_failure(&mut self) -> Option<String> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(failed) = self.record(joined) {
                return Some(failed);
            }
        }
        None
    }

    /// Signal shutdown and wait for every task to return.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!(tasks = self.tasks.len(), "Shutting down");
        // Receivers may already be gone if every task has exited
        let _ = self.shutdown.send(true);

        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }
        info!(
            completed = self.report.completed.len(),
            failed = self.report.failed.len(),
            "All tasks stopped"
        );
        self.report
    }

    /// Run until SIGINT/SIGTERM or a task failure, then shut down.
    pub async fn run_until_signal(mut self) -> ShutdownReport {
        tokio::select! {
            signal = shutdown_signal() => match signal {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
            },
            failed = self.wait_any_failure() => match failed {
                Some(task) => error!(task = %task, "Task failed, stopping"),
                None => info!("All tasks finished"),
            },
        }
        self.shutdown().await
    }

    fn record(&mut self, joined: Result<(String, TaskResult), tokio::task::JoinError>) -> Option<String> {
        match joined {
            Ok((name, Ok(()))) => {
                info!(task = %name, "Task finished");
                self.report.completed.push(name);
                None
            }
            Ok((name, Err(e))) => {
                error!(task = %name, error = %e, "Task failed");
                self.report.failed.push(name.clone());
                Some(name)
            }
            Err(e) => {
                error!(error = %e, "Task panicked");
                let name = "<panicked>".to_string();
                self.report.failed.push(name.clone());
                Some(name)
            }
        }
    }
}

/// Resolves on Ctrl+C, or on SIGTERM where available.
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn until_shutdown(mut shutdown: watch::Receiver<bool>) -> TaskResult {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_every_task() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("publisher", until_shutdown);
        supervisor.spawn("consumer", until_shutdown);
        assert_eq!(supervisor.len(), 2);

        let report = tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .unwrap();

        assert!(report.is_clean());
        let mut completed = report.completed;
        completed.sort();
        assert_eq!(completed, vec!["consumer".to_string(), "publisher".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_is_reported_without_stopping_others() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("healthy", until_shutdown);
        supervisor.spawn("broken", |_| async {
            Err::<(), TaskError>("stream setup failed".into())
        });

        let failed = supervisor.wait_any_failure().await;

        assert_eq!(failed.as_deref(), Some("broken"));
        assert_eq!(supervisor.len(), 1);

        let report = supervisor.shutdown().await;
        assert_eq!(report.failed, vec!["broken".to_string()]);
        assert_eq!(report.completed, vec!["healthy".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_any_failure_returns_none_when_all_succeed() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("one-shot", |_| async { Ok::<(), TaskError>(()) });

        assert_eq!(supervisor.wait_any_failure().await, None);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_task_counts_as_failure() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("panics", |_| async {
            if true {
                panic!("boom");
            }
            Ok::<(), TaskError>(())
        });

        assert!(supervisor.wait_any_failure().await.is_some());
        assert!(!supervisor.shutdown().await.is_clean());
    }
}
