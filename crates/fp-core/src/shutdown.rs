//! Coordinated, deadline-bounded teardown.
//!
//! Order: cancel the shared token, wait for background tasks, drain the
//! worker pool, then close resources in registration order (queue first, then
//! storage). One deadline bounds the whole sequence. Whatever is still
//! pending when it passes is forced and reported.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fp_queue::ReconnectingPublisher;
use fp_storage::MessageStore;

use crate::guard::BackgroundTasks;
use crate::worker_pool::WorkerPool;

/// A resource closed during shutdown.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> anyhow::Result<()>;

    /// Called when the deadline passed before `close` finished. The pending
    /// `close` future has already been dropped; the default does nothing more.
    fn force_close(&self) {}
}

/// Closes the storage client.
pub struct StoreShutdown {
    store: Arc<dyn MessageStore>,
}

impl StoreShutdown {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ShutdownHook for StoreShutdown {
    fn name(&self) -> &str {
        "storage"
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.store.close().await?;
        Ok(())
    }
}

#[async_trait]
impl ShutdownHook for ReconnectingPublisher {
    fn name(&self) -> &str {
        "publisher"
    }

    async fn close(&self) -> anyhow::Result<()> {
        ReconnectingPublisher::close(self).await?;
        Ok(())
    }
}

/// What happened during shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub elapsed: Duration,
    /// Steps that had to be forced, in order
    pub forced: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    deadline: Duration,
    tasks: BackgroundTasks,
    pool: Option<Arc<WorkerPool>>,
    hooks: Vec<Arc<dyn ShutdownHook>>,
}

impl ShutdownCoordinator {
    pub fn new(token: CancellationToken, deadline: Duration) -> Self {
        Self {
            token,
            deadline,
            tasks: BackgroundTasks::new(),
            pool: None,
            hooks: Vec::new(),
        }
    }

    pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Resources close in the order they are added.
    pub fn with_hook(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub async fn shutdown(self) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + self.deadline;
        let mut forced = Vec::new();

        info!(deadline_secs = self.deadline.as_secs_f64(), "Starting graceful shutdown");
        self.token.cancel();

        if timeout_at(deadline, self.tasks.wait()).await.is_err() {
            let aborted = self.tasks.abort_all();
            warn!(?aborted, "Background tasks still running at deadline, forcing stop");
            forced.push("background-tasks".to_string());
        }

        if let Some(pool) = &self.pool {
            if timeout_at(deadline, pool.shutdown()).await.is_err() {
                let aborted = pool.abort();
                warn!(aborted, "Worker pool did not drain before deadline, forcing stop");
                forced.push("worker-pool".to_string());
            }
        }

        for hook in &self.hooks {
            match timeout_at(deadline, hook.close()).await {
                Ok(Ok(())) => info!(resource = hook.name(), "Resource closed"),
                Ok(Err(e)) => warn!(resource = hook.name(), error = %e, "Error closing resource"),
                Err(_) => {
                    hook.force_close();
                    warn!(resource = hook.name(), "Shutdown timeout exceeded, forcing stop");
                    forced.push(hook.name().to_string());
                }
            }
        }

        let report = ShutdownReport {
            elapsed: started.elapsed(),
            forced,
        };
        if report.is_clean() {
            info!(elapsed_ms = report.elapsed.as_millis() as u64, "Shutdown complete");
        } else {
            warn!(
                elapsed_ms = report.elapsed.as_millis() as u64,
                forced = ?report.forced,
                "Shutdown complete with forced steps"
            );
        }
        report
    }
}
