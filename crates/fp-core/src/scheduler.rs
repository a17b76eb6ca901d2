//! Periodic job runner for the cron process.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::guard::guarded;
use crate::processor::IdempotencyCheck;

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, shutdown: &CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs: u64,
    pub skipped: u64,
    pub failures: u64,
}

pub struct Scheduler {
    interval: Duration,
    gate: Arc<dyn IdempotencyCheck>,
    shutdown: CancellationToken,
}

/// Shortest tick the scheduler accepts.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

impl Scheduler {
    /// `interval` is raised to [`MIN_INTERVAL`].
    pub fn new(
        interval: Duration,
        gate: Arc<dyn IdempotencyCheck>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            gate,
            shutdown,
        }
    }

    /// Tick every `interval` until shutdown. The first run happens one
    /// interval after start. A tick is skipped when the gate says so; job
    /// errors and panics are logged and do not stop the loop.
    pub async fn run(&self, job: Arc<dyn ScheduledJob>) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(job = job.name(), interval_secs = self.interval.as_secs_f64(), "Scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!(job = job.name(), "Scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if !self.gate.should_run_scheduled_task().await {
                debug!(job = job.name(), "Skipping scheduled run");
                stats.skipped += 1;
                continue;
            }

            match guarded(job.name(), job.run(&self.shutdown)).await {
                Ok(Ok(())) => {
                    stats.runs += 1;
                    debug!(job = job.name(), "Scheduled run complete");
                }
                Ok(Err(e)) => {
                    stats.failures += 1;
                    error!(job = job.name(), error = %e, "Scheduled run failed");
                }
                Err(_) => stats.failures += 1,
            }
        }

        stats
    }
}
