//! OrderService Tests
//!
//! Tests for:
//! - Consumed messages are persisted
//! - Order creation fans payment, notification and the created event out
//!   through the worker pool
//! - Reminders and the breaker/retry helpers
//! - Pool shutdown surfaces as an error to callers

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use fp_core::{
    AlwaysProcess, BreakerSettings, CircuitBreaker, CircuitState, CoreError, MessageHandler,
    OrderEffects, OrderService, PoolError, RetryPolicy, ScheduledJob, WorkerPool,
};
use fp_queue::{InMemoryBroker, ReconnectingPublisher};
use fp_storage::{InMemoryStore, MessageStore};

/// Effects that record which orders were charged and notified.
#[derive(Default)]
struct MockEffects {
    charged: Mutex<Vec<String>>,
    notified: Mutex<Vec<String>>,
    fail_payments: bool,
}

impl MockEffects {
    fn failing_payments() -> Arc<Self> {
        Arc::new(Self {
            fail_payments: true,
            ..Default::default()
        })
    }
}

#[async_trait]
impl OrderEffects for MockEffects {
    async fn charge(&self, order_ref: &str) -> anyhow::Result<()> {
        if self.fail_payments {
            anyhow::bail!("payment gateway down");
        }
        self.charged.lock().push(order_ref.to_string());
        Ok(())
    }

    async fn notify(&self, order_ref: &str) -> anyhow::Result<()> {
        self.notified.lock().push(order_ref.to_string());
        Ok(())
    }
}

struct Harness {
    broker: InMemoryBroker,
    store: Arc<InMemoryStore>,
    effects: Arc<MockEffects>,
    service: OrderService,
}

impl Harness {
    fn new() -> Self {
        Self::with_effects(Arc::new(MockEffects::default()))
    }

    fn with_effects(effects: Arc<MockEffects>) -> Self {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(ReconnectingPublisher::new(
            Arc::new(broker.clone()),
            "exchange",
            "key",
        ));
        let service = OrderService::new(
            store.clone(),
            publisher,
            effects.clone(),
            Arc::new(WorkerPool::new(2, 10)),
            Arc::new(CircuitBreaker::new(BreakerSettings::default())),
            RetryPolicy::new(3, Duration::from_millis(100)),
            Arc::new(AlwaysProcess),
        );
        Self {
            broker,
            store,
            effects,
            service,
        }
    }
}

#[tokio::test]
async fn test_process_message_persists() {
    let harness = Harness::new();

    harness.service.process_message("hello").await.unwrap();
    harness
        .service
        .handle(b"world", &CancellationToken::new())
        .await
        .unwrap();

    let stored: Vec<String> = harness
        .store
        .messages()
        .into_iter()
        .map(|m| m.message)
        .collect();
    assert_eq!(stored, vec!["hello".to_string(), "world".to_string()]);
}

#[tokio::test]
async fn test_process_message_surfaces_storage_errors() {
    let harness = Harness::new();
    harness.store.fail_next_inserts(1);

    assert!(harness.service.process_message("hello").await.is_err());
    assert!(harness.store.messages().is_empty());
}

#[tokio::test]
async fn test_create_order_fans_out_through_pool() {
    let harness = Harness::new();

    let order_id = harness.service.create_order("ORD-1").await.unwrap();
    harness.service.pool().shutdown().await;

    assert_eq!(*harness.effects.charged.lock(), vec!["ORD-1".to_string()]);
    assert_eq!(*harness.effects.notified.lock(), vec!["ORD-1".to_string()]);

    let published = harness.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "exchange");
    assert_eq!(published[0].routing_key, "key");
    let event: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(event["orderId"], order_id.as_str());
    assert_eq!(event["status"], "created");
    assert_eq!(harness.service.pool().stats().completed, 3);
}

#[tokio::test]
async fn test_failed_payment_does_not_block_other_effects() {
    let harness = Harness::with_effects(MockEffects::failing_payments());

    harness.service.create_order("ORD-2").await.unwrap();
    harness.service.pool().shutdown().await;

    assert!(harness.effects.charged.lock().is_empty());
    assert_eq!(*harness.effects.notified.lock(), vec!["ORD-2".to_string()]);
    assert_eq!(harness.broker.published().len(), 1);
    assert_eq!(harness.service.breaker().counts().total_failures, 1);
}

#[tokio::test]
async fn test_create_order_after_pool_shutdown_fails() {
    let harness = Harness::new();
    harness.service.pool().shutdown().await;

    let result = harness.service.create_order("ORD-3").await;

    assert!(matches!(result, Err(CoreError::Pool(PoolError::Closed))));
    assert!(harness.broker.published().is_empty());
}

#[tokio::test]
async fn test_send_order_reminders() {
    let harness = Harness::new();
    let orders: Vec<String> = (1..=4).map(|i| format!("ORD-{}", i)).collect();

    let queued = harness.service.send_order_reminders(&orders).await.unwrap();
    harness.service.pool().shutdown().await;

    assert_eq!(queued, 4);
    let mut notified = harness.effects.notified.lock().clone();
    notified.sort();
    assert_eq!(notified, orders);
}

#[tokio::test(start_paused = true)]
async fn test_call_with_breaker_trips_shared_breaker() {
    let harness = Harness::new();

    for _ in 0..5 {
        let result = harness
            .service
            .call_with_breaker(|| async { Err::<(), _>(anyhow::anyhow!("timeout")) })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(harness.service.breaker().state(), CircuitState::Open);

    let calls = AtomicU32::new(0);
    let rejected = harness
        .service
        .call_with_breaker(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(rejected.unwrap_err().is_rejected());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_call_with_retry() {
    let harness = Harness::new();
    let calls = AtomicU32::new(0);

    let value = harness
        .service
        .call_with_retry(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("flaky");
            }
            Ok(42)
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_scheduled_report_counts_messages() {
    let harness = Harness::new();
    harness.store.insert_message("a").await.unwrap();

    assert_eq!(harness.service.name(), "order-report");
    harness
        .service
        .run(&CancellationToken::new())
        .await
        .unwrap();

    harness.store.set_reachable(false);
    assert!(!harness.store.ping(Duration::from_millis(10)).await);
}
