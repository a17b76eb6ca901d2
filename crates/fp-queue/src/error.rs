use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Queue declaration failed: {0}")]
    Declare(String),

    #[error("Subscription error: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Connection is closed")]
    Closed,
}

impl QueueError {
    /// True when the failure means the connection itself is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Closed)
    }
}
