//! Outbound event publishing over a lazily re-dialed connection.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{QueueConnection, QueueConnector, Result};

/// Publishes one event payload.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<()>;
}

/// Publisher that keeps one connection and dials a new one whenever the
/// cached connection is gone.
pub struct ReconnectingPublisher {
    connector: Arc<dyn QueueConnector>,
    exchange: String,
    routing_key: String,
    connection: Mutex<Option<Arc<dyn QueueConnection>>>,
}

impl ReconnectingPublisher {
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            connection: Mutex::new(None),
        }
    }

    /// Return the cached connection if still connected, otherwise dial.
    async fn ensure_connection(&self) -> Result<Arc<dyn QueueConnection>> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
            info!(endpoint = %self.connector.endpoint(), "Publisher connection lost, redialing");
        }

        let conn = self.connector.connect().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forget `failed` if it is still the cached connection, then close it.
    /// A newer connection dialled by another caller is left in place.
    async fn evict(&self, failed: &Arc<dyn QueueConnection>) {
        {
            let mut slot = self.connection.lock().await;
            if slot.as_ref().is_some_and(|cached| Arc::ptr_eq(cached, failed)) {
                slot.take();
            }
        }
        if let Err(e) = failed.close().await {
            debug!(error = %e, "Closing failed publisher connection");
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self.connection.lock().await.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventPublisher for ReconnectingPublisher {
    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let conn = self.ensure_connection().await?;
        match conn.publish(&self.exchange, &self.routing_key, payload).await {
            Ok(()) => {
                debug!(exchange = %self.exchange, routing_key = %self.routing_key, "Event published");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Publish failed, dropping cached connection");
                self.evict(&conn).await;
                Err(e)
            }
        }
    }
}
