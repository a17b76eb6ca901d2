//! Fault containment for units of work.
//!
//! A panic inside a delivery, a pool task or a background loop must not take
//! the process down. [`guarded`] turns the panic into a logged [`Fault`];
//! [`BackgroundTasks`] runs long-lived loops under the same guard and lets the
//! shutdown path wait for them or abort them.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

/// A contained panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub task: String,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} panicked: {}", self.task, self.message)
    }
}

impl std::error::Error for Fault {}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Run `future`, converting a panic into a logged [`Fault`].
pub async fn guarded<F, T>(task: &str, future: F) -> Result<T, Fault>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
            let message = panic_message(&*payload);
            error!(task = %task, panic_msg = %message, "Recovered from panic");
            Err(Fault {
                task: task.to_string(),
                message,
            })
        }
    }
}

/// Tracker for the long-running tasks of a process (consumer loop, servers,
/// scheduler).
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    aborts: Arc<Mutex<Vec<(String, AbortHandle)>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` under the fault guard.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = self.tracker.spawn(async move {
            if guarded(&task_name, future).await.is_ok() {
                debug!(task = %task_name, "Background task finished");
            }
        });
        self.aborts.lock().push((name, handle.abort_handle()));
    }

    /// Tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Close the tracker and wait for every tracked task to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Abort whatever is still running. Returns the names of aborted tasks.
    pub fn abort_all(&self) -> Vec<String> {
        let handles = self.aborts.lock();
        handles
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, handle)| {
                handle.abort();
                name.clone()
            })
            .collect()
    }
}
