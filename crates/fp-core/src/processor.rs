//! Per-delivery processing contract.
//!
//! Every delivery ends in exactly one of acknowledge or requeue:
//!
//! | outcome                          | resolution |
//! |----------------------------------|------------|
//! | identity already processed       | ack        |
//! | handler succeeded                | ack        |
//! | handler failed                   | requeue    |
//! | handler or idempotency panicked  | requeue    |

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fp_queue::Delivery;

use crate::consumer::MessageConsumer;
use crate::guard::guarded;

/// State checks consulted before doing work. Answers are taken as given.
#[async_trait]
pub trait IdempotencyCheck: Send + Sync {
    async fn is_already_processed(&self, identity: &str) -> bool;

    async fn should_run_scheduled_task(&self) -> bool;
}

/// Reports nothing as processed and always allows the scheduled task.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysProcess;

#[async_trait]
impl IdempotencyCheck for AlwaysProcess {
    async fn is_already_processed(&self, _identity: &str) -> bool {
        false
    }

    async fn should_run_scheduled_task(&self) -> bool {
        true
    }
}

/// Business operation applied to each new delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], shutdown: &CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acknowledged,
    Duplicate,
    Requeued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub acknowledged: u64,
    pub duplicates: u64,
    pub requeued: u64,
    /// Settlement calls that failed; the broker redelivers these
    pub settle_failures: u64,
}

#[derive(Default)]
struct Counters {
    acknowledged: AtomicU64,
    duplicates: AtomicU64,
    requeued: AtomicU64,
    settle_failures: AtomicU64,
}

pub struct DeliveryProcessor {
    idempotency: Arc<dyn IdempotencyCheck>,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
    counters: Counters,
}

impl DeliveryProcessor {
    pub fn new(
        idempotency: Arc<dyn IdempotencyCheck>,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            idempotency,
            handler,
            shutdown,
            counters: Counters::default(),
        }
    }

    /// Classify, process and settle one delivery. Never fails.
    pub async fn handle_one(&self, delivery: Delivery) -> Resolution {
        let identity = delivery.identity();

        let decision = guarded("delivery", async {
            if self.idempotency.is_already_processed(&identity).await {
                return Ok(Resolution::Duplicate);
            }
            self.handler
                .handle(delivery.payload(), &self.shutdown)
                .await
                .map(|()| Resolution::Acknowledged)
        })
        .await;

        let resolution = match decision {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(e)) => {
                error!(identity = %identity, error = %e, "Error processing message, requeueing");
                Resolution::Requeued
            }
            Err(fault) => {
                error!(identity = %identity, panic_msg = %fault.message, "Processing panicked, requeueing");
                Resolution::Requeued
            }
        };

        let settled = match resolution {
            Resolution::Duplicate => {
                info!(identity = %identity, "Skipping duplicate message");
                self.counters.duplicates.fetch_add(1, Ordering::SeqCst);
                delivery.ack().await
            }
            Resolution::Acknowledged => {
                self.counters.acknowledged.fetch_add(1, Ordering::SeqCst);
                delivery.ack().await
            }
            Resolution::Requeued => {
                self.counters.requeued.fetch_add(1, Ordering::SeqCst);
                delivery.requeue().await
            }
        };

        if let Err(e) = settled {
            self.counters.settle_failures.fetch_add(1, Ordering::SeqCst);
            warn!(
                identity = %identity,
                resolution = ?resolution,
                error = %e,
                "Failed to settle delivery, broker will redeliver"
            );
        }

        resolution
    }

    /// Process deliveries one at a time until the consumer stops.
    pub async fn run(&self, consumer: &mut MessageConsumer) -> u64 {
        info!("Delivery processing started");
        let mut handled = 0u64;
        while let Some(delivery) = consumer.next_delivery().await {
            self.handle_one(delivery).await;
            handled += 1;
        }
        info!(handled, "Delivery processing stopped");
        handled
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            acknowledged: self.counters.acknowledged.load(Ordering::SeqCst),
            duplicates: self.counters.duplicates.load(Ordering::SeqCst),
            requeued: self.counters.requeued.load(Ordering::SeqCst),
            settle_failures: self.counters.settle_failures.load(Ordering::SeqCst),
        }
    }
}
