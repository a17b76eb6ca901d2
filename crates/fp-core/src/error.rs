use fp_queue::QueueError;
use fp_storage::StorageError;
use thiserror::Error;

use crate::worker_pool::PoolError;

#[derive(Error, Debug)]
pub enum CoreError {
    /// The first connection or subscription could not be established.
    /// This is the only queue failure that is not retried.
    #[error("Initial queue connection failed: {0}")]
    InitialConnection(#[source] QueueError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
