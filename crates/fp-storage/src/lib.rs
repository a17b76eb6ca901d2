//! Storage collaborator.
//!
//! The pipeline only needs to persist processed message payloads, count them,
//! and know whether the store is reachable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "mongo")]
pub mod mongo;

#[cfg(feature = "mongo")]
pub use mongo::MongoStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage connection failed: {0}")]
    Connection(String),

    #[error("Storage operation failed: {0}")]
    Operation(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A processed message as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message: String,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &str) -> Result<()>;

    async fn count_messages(&self) -> Result<u64>;

    /// Reachability probe bounded by `timeout`. Never errors; a failed or
    /// late probe is `false`.
    async fn ping(&self, timeout: Duration) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Process-local store used by tests and the no-database dev mode.
pub struct InMemoryStore {
    messages: Mutex<Vec<StoredMessage>>,
    fail_inserts: Mutex<u32>,
    reachable: Mutex<bool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail_inserts: Mutex::new(0),
            reachable: Mutex::new(true),
        }
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.messages.lock().clone()
    }

    /// Make the next `count` inserts fail.
    pub fn fail_next_inserts(&self, count: u32) {
        *self.fail_inserts.lock() = count;
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock() = reachable;
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert_message(&self, message: &str) -> Result<()> {
        {
            let mut failing = self.fail_inserts.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(StorageError::Operation("injected insert failure".to_string()));
            }
        }
        self.messages.lock().push(StoredMessage {
            message: message.to_string(),
            received_at: Utc::now(),
        });
        Ok(())
    }

    async fn count_messages(&self) -> Result<u64> {
        Ok(self.messages.lock().len() as u64)
    }

    async fn ping(&self, _timeout: Duration) -> bool {
        *self.reachable.lock()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
