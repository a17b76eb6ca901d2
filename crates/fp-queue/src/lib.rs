//! Queue collaborator contract.
//!
//! A [`QueueConnector`] dials the broker and yields a [`QueueConnection`].
//! A connection owns one subscription at a time and is never reused once it
//! is closed or lost: callers dial a fresh one instead.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

pub mod delivery;
pub mod error;
pub mod memory;
pub mod publisher;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use delivery::{Acknowledger, Delivery};
pub use error::QueueError;
pub use memory::InMemoryBroker;
pub use publisher::{EventPublisher, ReconnectingPublisher};

pub type Result<T> = std::result::Result<T, QueueError>;

/// Deliveries in arrival order. The stream ends (or yields an error) when the
/// underlying subscription is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// What to subscribe to and how.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Declared durable, non-exclusive and non-auto-deleting before consuming
    pub queue_name: String,
    pub consumer_tag: String,
    pub prefetch_count: u16,
}

impl SubscribeOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            consumer_tag: "consumer".to_string(),
            prefetch_count: 1,
        }
    }
}

/// Dials the broker.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn QueueConnection>>;

    /// Endpoint description for logs; must not contain credentials.
    fn endpoint(&self) -> String;
}

/// One live broker connection.
#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Declare the queue and start consuming with manual acknowledgement.
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<DeliveryStream>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Close the channel and the connection. Unacknowledged deliveries go back
    /// to the broker.
    async fn close(&self) -> Result<()>;
}
