//! Bounded worker pool for side-effect fan-out.
//!
//! A fixed number of workers drain a mailbox of fixed capacity. `submit`
//! waits while the mailbox is full, which is the pool's only backpressure.
//! `shutdown` closes the mailbox once and waits for the workers to run every
//! task already accepted.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use fp_config::WorkerPoolConfig;

use crate::guard::guarded;

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    started: AtomicU64,
    running: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub capacity: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub panicked: u64,
}

pub struct WorkerPool {
    worker_count: usize,
    capacity: usize,
    sender: parking_lot::Mutex<Option<mpsc::Sender<Task>>>,
    /// Cancelled before the sender is dropped; releases blocked submitters
    closing: CancellationToken,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    aborts: Vec<AbortHandle>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Spawn `workers` workers sharing a mailbox of `capacity` slots. Both are
    /// raised to at least one.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let worker_count = workers.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel::<Task>(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(PoolCounters::default());

        let mut handles = Vec::with_capacity(worker_count);
        let mut aborts = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let handle = tokio::spawn(Self::worker_loop(
                worker_id,
                receiver.clone(),
                counters.clone(),
            ));
            aborts.push(handle.abort_handle());
            handles.push(handle);
        }

        info!(workers = worker_count, capacity, "Worker pool started");

        Self {
            worker_count,
            capacity,
            sender: parking_lot::Mutex::new(Some(sender)),
            closing: CancellationToken::new(),
            handles: tokio::sync::Mutex::new(handles),
            aborts,
            counters,
        }
    }

    async fn worker_loop(
        worker_id: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
        counters: Arc<PoolCounters>,
    ) {
        let name = format!("worker-{}", worker_id);
        loop {
            let task = {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            };
            let Some(task) = task else {
                break;
            };

            counters.started.fetch_add(1, Ordering::SeqCst);
            counters.running.fetch_add(1, Ordering::SeqCst);
            if guarded(&name, task).await.is_err() {
                counters.panicked.fetch_add(1, Ordering::SeqCst);
            }
            counters.running.fetch_sub(1, Ordering::SeqCst);
            counters.completed.fetch_add(1, Ordering::SeqCst);
        }
        debug!(worker_id, "Worker exiting, mailbox closed and drained");
    }

    /// Enqueue `task`, waiting for a free slot if the mailbox is full.
    ///
    /// A submitter still waiting when shutdown begins gets
    /// [`PoolError::Closed`] and its task is dropped unrun.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.lock().clone().ok_or(PoolError::Closed)?;
        let permit = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(PoolError::Closed),
            permit = sender.reserve() => permit.map_err(|_| PoolError::Closed)?,
        };
        // Under the lock shutdown takes: the send lands before the close or not at all
        let guard = self.sender.lock();
        if guard.is_none() || self.closing.is_cancelled() {
            return Err(PoolError::Closed);
        }
        permit.send(Box::pin(task));
        drop(guard);
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Close the mailbox and wait until every accepted task has run and every
    /// worker has exited. Safe to call more than once and from several tasks.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let sender = self.sender.lock().take();
        if sender.is_some() {
            info!(
                queued = self.queued(),
                "Closing worker pool, draining queued tasks"
            );
        }
        drop(sender);

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Worker terminated abnormally");
                }
            }
        }
    }

    /// Abort every worker that is still running. Tasks that have not started
    /// are dropped. Returns the number of workers aborted.
    pub fn abort(&self) -> usize {
        self.closing.cancel();
        self.sender.lock().take();
        self.aborts
            .iter()
            .filter(|handle| !handle.is_finished())
            .map(|handle| handle.abort())
            .count()
    }

    /// Accepted tasks no worker has picked up yet. Approximate while
    /// submissions are in flight.
    fn queued(&self) -> usize {
        let submitted = self.counters.submitted.load(Ordering::SeqCst);
        let started = self.counters.started.load(Ordering::SeqCst);
        submitted.saturating_sub(started) as usize
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.worker_count,
            capacity: self.capacity,
            queued: self.queued(),
            running: self.counters.running.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            panicked: self.counters.panicked.load(Ordering::SeqCst),
        }
    }
}

impl From<&WorkerPoolConfig> for WorkerPool {
    fn from(config: &WorkerPoolConfig) -> Self {
        Self::new(config.workers, config.capacity)
    }
}
