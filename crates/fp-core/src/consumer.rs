//! Message consumer with transparent reconnection.
//!
//! [`MessageConsumer`] owns the live connection and its subscription and hands
//! out deliveries one at a time. When the subscription closes it checks the
//! shutdown token first and otherwise re-dials forever with a fixed delay,
//! replacing the old connection wholesale. Unacknowledged deliveries are left
//! to the broker, which redelivers them on the new subscription.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fp_config::AmqpConfig;
use fp_queue::{
    Delivery, DeliveryStream, QueueConnection, QueueConnector, QueueError, SubscribeOptions,
};

use crate::error::{CoreError, Result};
use crate::shutdown::ShutdownHook;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub subscribe: SubscribeOptions,
    /// Fixed wait between reconnect attempts
    pub reconnect_delay: Duration,
}

impl ConsumerSettings {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            subscribe: SubscribeOptions::new(queue_name),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

impl From<&AmqpConfig> for ConsumerSettings {
    fn from(config: &AmqpConfig) -> Self {
        Self {
            subscribe: SubscribeOptions {
                queue_name: config.queue_name.clone(),
                consumer_tag: config.consumer_tag.clone(),
                prefetch_count: config.prefetch_count,
            },
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// The live connection, shared between the consumer (which replaces it) and
/// the shutdown path (which may only close it).
#[derive(Default)]
struct ConnectionSlot {
    current: Mutex<Option<Arc<dyn QueueConnection>>>,
    closed: AtomicBool,
}

impl ConnectionSlot {
    /// Install `connection` unless the slot was closed. The closed check and
    /// the install happen under the same lock as [`ConnectionSlot::close`].
    fn install(&self, connection: Arc<dyn QueueConnection>) -> bool {
        let mut current = self.current.lock();
        if self.is_closed() {
            return false;
        }
        *current = Some(connection);
        true
    }

    /// Mark the slot closed. The connection stays in the slot until its close
    /// finishes or is forced. `None` on later calls.
    fn close(&self) -> Option<Arc<dyn QueueConnection>> {
        let current = self.current.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        current.clone()
    }

    fn take(&self) -> Option<Arc<dyn QueueConnection>> {
        self.current.lock().take()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Read access to consumer liveness plus the one-shot close used at shutdown.
#[derive(Clone)]
pub struct ConsumerHandle {
    slot: Arc<ConnectionSlot>,
    reconnects: Arc<AtomicU64>,
}

impl ConsumerHandle {
    pub fn is_connected(&self) -> bool {
        if self.slot.is_closed() {
            return false;
        }
        self.slot
            .current
            .lock()
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }

    /// Successful reconnects since start.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Close the current connection. Later calls are no-ops, and the consumer
    /// will not install a new connection afterwards.
    pub async fn close(&self) -> std::result::Result<(), QueueError> {
        let Some(connection) = self.slot.close() else {
            return Ok(());
        };
        info!("Shutting down queue connection");
        let result = connection.close().await;
        self.slot.take();
        result?;
        info!("Queue connection shutdown complete");
        Ok(())
    }

    /// Give up on a clean close: mark the slot closed and drop the connection
    /// without waiting for the broker.
    pub fn force_close(&self) {
        self.slot.closed.store(true, Ordering::SeqCst);
        if self.slot.take().is_some() {
            warn!("Dropped queue connection without a clean close");
        }
    }
}

#[async_trait]
impl ShutdownHook for ConsumerHandle {
    fn name(&self) -> &str {
        "queue"
    }

    async fn close(&self) -> anyhow::Result<()> {
        ConsumerHandle::close(self).await?;
        Ok(())
    }

    fn force_close(&self) {
        ConsumerHandle::force_close(self);
    }
}

pub struct MessageConsumer {
    connector: Arc<dyn QueueConnector>,
    settings: ConsumerSettings,
    shutdown: CancellationToken,
    slot: Arc<ConnectionSlot>,
    stream: Option<DeliveryStream>,
    reconnects: Arc<AtomicU64>,
}

impl MessageConsumer {
    /// Connect, declare the queue and subscribe.
    ///
    /// Failure here is returned as [`CoreError::InitialConnection`] and is not
    /// retried.
    pub async fn start(
        connector: Arc<dyn QueueConnector>,
        settings: ConsumerSettings,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let (connection, stream) = open(connector.as_ref(), &settings)
            .await
            .map_err(CoreError::InitialConnection)?;

        let slot = Arc::new(ConnectionSlot::default());
        slot.install(connection);

        info!(
            endpoint = %connector.endpoint(),
            queue = %settings.subscribe.queue_name,
            "Consumer started successfully"
        );

        Ok(Self {
            connector,
            settings,
            shutdown,
            slot,
            stream: Some(stream),
            reconnects: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            slot: self.slot.clone(),
            reconnects: self.reconnects.clone(),
        }
    }

    /// Next delivery in arrival order. `None` only once shutdown has begun.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            let next = match self.stream.as_mut() {
                Some(stream) => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        info!("Shutdown requested, stopping consumer");
                        return None;
                    }
                    item = stream.next() => item,
                },
                None => None,
            };

            match next {
                Some(Ok(delivery)) => {
                    debug!(identity = %delivery.identity(), redelivered = delivery.redelivered(), "Received message");
                    return Some(delivery);
                }
                Some(Err(e)) => warn!(error = %e, "Subscription failed"),
                None => warn!("Delivery stream closed"),
            }

            self.stream = None;
            if !self.reconnect().await {
                return None;
            }
        }
    }

    /// The same sequence as [`MessageConsumer::next_delivery`], as a stream.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send {
        stream::unfold(self, |mut consumer| async move {
            consumer
                .next_delivery()
                .await
                .map(|delivery| (delivery, consumer))
        })
    }

    /// Replace the dead connection. Returns false if shutdown intervened.
    async fn reconnect(&mut self) -> bool {
        if self.shutdown.is_cancelled() || self.slot.is_closed() {
            info!("Shutdown in progress, skipping reconnect");
            return false;
        }

        if let Some(old) = self.slot.take() {
            // The old connection is never reused; closing it is best effort
            if tokio::time::timeout(self.settings.reconnect_delay, old.close())
                .await
                .is_err()
            {
                debug!("Timed out closing the lost connection");
            }
        }

        warn!(
            endpoint = %self.connector.endpoint(),
            delay_secs = self.settings.reconnect_delay.as_secs_f64(),
            "Queue connection lost, reconnecting"
        );

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;

            let opened = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested during reconnect");
                    return false;
                }
                opened = open(self.connector.as_ref(), &self.settings) => opened,
            };

            match opened {
                Ok((connection, stream)) => {
                    if !self.slot.install(connection.clone()) {
                        info!("Consumer closed during reconnect, discarding new connection");
                        let _ = connection.close().await;
                        return false;
                    }
                    self.stream = Some(stream);
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                    info!(attempt, "Queue reconnected successfully");
                    return true;
                }
                Err(e) => {
                    error!(
                        attempt,
                        error = %e,
                        retry_in_secs = self.settings.reconnect_delay.as_secs_f64(),
                        "Reconnect attempt failed"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested during reconnect");
                    return false;
                }
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
    }
}

/// Dial and subscribe; a connection whose subscription fails is closed.
async fn open(
    connector: &dyn QueueConnector,
    settings: &ConsumerSettings,
) -> std::result::Result<(Arc<dyn QueueConnection>, DeliveryStream), QueueError> {
    let connection = connector.connect().await?;
    match connection.subscribe(&settings.subscribe).await {
        Ok(stream) => Ok((connection, stream)),
        Err(e) => {
            let _ = connection.close().await;
            Err(e)
        }
    }
}
