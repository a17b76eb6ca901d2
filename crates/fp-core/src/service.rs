//! Order service: the business side wired to the resilience machinery.
//!
//! Incoming queue messages are stored. Creating an order fans payment,
//! notification and the `created` event out through the worker pool; payment
//! and event publication go through the circuit breaker.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use fp_config::AppConfig;
use fp_queue::EventPublisher;
use fp_storage::MessageStore;

use crate::circuit_breaker::{BreakerError, BreakerSettings, CircuitBreaker};
use crate::error::Result;
use crate::processor::{AlwaysProcess, IdempotencyCheck, MessageHandler};
use crate::retry::{RetryError, RetryPolicy};
use crate::scheduler::ScheduledJob;
use crate::worker_pool::WorkerPool;

/// Side effects triggered per order.
#[async_trait]
pub trait OrderEffects: Send + Sync {
    async fn charge(&self, order_ref: &str) -> anyhow::Result<()>;

    async fn notify(&self, order_ref: &str) -> anyhow::Result<()>;
}

/// Stand-in effects that only take time.
#[derive(Debug, Clone)]
pub struct SimulatedEffects {
    pub payment_delay: Duration,
    pub notification_delay: Duration,
}

impl Default for SimulatedEffects {
    fn default() -> Self {
        Self {
            payment_delay: Duration::from_secs(3),
            notification_delay: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl OrderEffects for SimulatedEffects {
    async fn charge(&self, order_ref: &str) -> anyhow::Result<()> {
        info!(order = %order_ref, "Processing payment");
        tokio::time::sleep(self.payment_delay).await;
        info!(order = %order_ref, "Payment completed");
        Ok(())
    }

    async fn notify(&self, order_ref: &str) -> anyhow::Result<()> {
        info!(order = %order_ref, "Sending notification");
        tokio::time::sleep(self.notification_delay).await;
        info!(order = %order_ref, "Notification sent");
        Ok(())
    }
}

pub struct OrderService {
    store: Arc<dyn MessageStore>,
    publisher: Arc<dyn EventPublisher>,
    effects: Arc<dyn OrderEffects>,
    pool: Arc<WorkerPool>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    idempotency: Arc<dyn IdempotencyCheck>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        publisher: Arc<dyn EventPublisher>,
        effects: Arc<dyn OrderEffects>,
        pool: Arc<WorkerPool>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        idempotency: Arc<dyn IdempotencyCheck>,
    ) -> Self {
        Self {
            store,
            publisher,
            effects,
            pool,
            breaker,
            retry,
            idempotency,
        }
    }

    /// Pool, breaker and retry policy from `config`, simulated side effects
    /// and the permissive idempotency check.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn MessageStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self::new(
            store,
            publisher,
            Arc::new(SimulatedEffects::default()),
            Arc::new(WorkerPool::from(&config.worker_pool)),
            Arc::new(CircuitBreaker::new(BreakerSettings::from(
                &config.circuit_breaker,
            ))),
            RetryPolicy::from(&config.retry),
            Arc::new(AlwaysProcess),
        )
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Persist one consumed message.
    pub async fn process_message(&self, message: &str) -> anyhow::Result<()> {
        info!(message = %message, "Processing message");
        self.store.insert_message(message).await?;
        Ok(())
    }

    /// Accept an order and fan its side effects out through the pool.
    /// Returns the generated order id. Waits while the pool is saturated.
    pub async fn create_order(&self, order_ref: &str) -> Result<String> {
        let order_id = Uuid::new_v4().to_string();
        info!(order = %order_ref, order_id = %order_id, "Order created");

        let effects = self.effects.clone();
        let breaker = self.breaker.clone();
        let reference = order_ref.to_string();
        self.pool
            .submit(async move {
                if let Err(e) = breaker.execute(|| effects.charge(&reference)).await {
                    warn!(order = %reference, error = %e, "Payment failed");
                }
            })
            .await?;

        let effects = self.effects.clone();
        let reference = order_ref.to_string();
        self.pool
            .submit(async move {
                if let Err(e) = effects.notify(&reference).await {
                    warn!(order = %reference, error = %e, "Notification failed");
                }
            })
            .await?;

        let publisher = self.publisher.clone();
        let breaker = self.breaker.clone();
        let event = serde_json::json!({ "orderId": order_id, "status": "created" }).to_string();
        let id = order_id.clone();
        self.pool
            .submit(async move {
                if let Err(e) = breaker.execute(|| publisher.publish(event.as_bytes())).await {
                    warn!(order_id = %id, error = %e, "Failed to publish order event");
                }
            })
            .await?;

        Ok(order_id)
    }

    /// One notification task per order. Returns how many were queued.
    pub async fn send_order_reminders(&self, order_refs: &[String]) -> Result<usize> {
        for order_ref in order_refs {
            let effects = self.effects.clone();
            let reference = order_ref.clone();
            self.pool
                .submit(async move {
                    if let Err(e) = effects.notify(&reference).await {
                        warn!(order = %reference, error = %e, "Reminder failed");
                    }
                })
                .await?;
        }
        Ok(order_refs.len())
    }

    /// Call an external dependency through the shared breaker.
    pub async fn call_with_breaker<F, Fut, T>(
        &self,
        operation: F,
    ) -> std::result::Result<T, BreakerError<anyhow::Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.breaker.execute(operation).await
    }

    /// Call an external dependency under the configured retry policy.
    pub async fn call_with_retry<F, Fut, T>(
        &self,
        operation: F,
    ) -> std::result::Result<T, RetryError<anyhow::Error>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.retry.run(operation).await
    }
}

#[async_trait]
impl MessageHandler for OrderService {
    async fn handle(&self, payload: &[u8], _shutdown: &CancellationToken) -> anyhow::Result<()> {
        let message = String::from_utf8_lossy(payload);
        self.process_message(&message).await
    }
}

#[async_trait]
impl IdempotencyCheck for OrderService {
    async fn is_already_processed(&self, identity: &str) -> bool {
        self.idempotency.is_already_processed(identity).await
    }

    async fn should_run_scheduled_task(&self) -> bool {
        self.idempotency.should_run_scheduled_task().await
    }
}

#[async_trait]
impl ScheduledJob for OrderService {
    fn name(&self) -> &str {
        "order-report"
    }

    async fn run(&self, _shutdown: &CancellationToken) -> anyhow::Result<()> {
        let stored = self.store.count_messages().await?;
        info!(stored, "Scheduled order report");
        Ok(())
    }
}
