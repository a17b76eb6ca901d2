//! ShutdownCoordinator Tests
//!
//! Tests for:
//! - Cancellation reaches background tasks
//! - Ordering: tasks, then pool drain, then resources in registration order
//! - A single deadline bounds the whole sequence
//! - Stuck steps are forced and reported

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fp_core::{
    BackgroundTasks, ConsumerSettings, MessageConsumer, ShutdownCoordinator, ShutdownHook,
    StoreShutdown, WorkerPool,
};
use fp_queue::InMemoryBroker;
use fp_storage::{InMemoryStore, MessageStore};

/// Resource that records when it was closed.
struct MockResource {
    name: &'static str,
    close_delay: Duration,
    log: Arc<Mutex<Vec<String>>>,
    forced: AtomicBool,
}

impl MockResource {
    fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Self::with_delay(name, Duration::ZERO, log)
    }

    fn with_delay(
        name: &'static str,
        close_delay: Duration,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            close_delay,
            log: log.clone(),
            forced: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ShutdownHook for MockResource {
    fn name(&self) -> &str {
        self.name
    }

    async fn close(&self) -> anyhow::Result<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.log.lock().push(self.name.to_string());
        Ok(())
    }

    fn force_close(&self) {
        self.forced.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_clean_shutdown_in_order() {
    let token = CancellationToken::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let tasks = BackgroundTasks::new();
    {
        let token = token.clone();
        let log = log.clone();
        tasks.spawn("loop", async move {
            token.cancelled().await;
            log.lock().push("loop".to_string());
        });
    }

    let pool = Arc::new(WorkerPool::new(2, 4));
    for i in 0..3 {
        let log = log.clone();
        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            log.lock().push(format!("task-{}", i));
        })
        .await
        .unwrap();
    }

    let report = ShutdownCoordinator::new(token.clone(), Duration::from_secs(5))
        .with_tasks(tasks)
        .with_pool(pool.clone())
        .with_hook(MockResource::new("queue", &log))
        .with_hook(MockResource::new("storage", &log))
        .shutdown()
        .await;

    assert!(report.is_clean(), "forced: {:?}", report.forced);
    assert!(token.is_cancelled());
    assert!(pool.is_closed());

    let log = log.lock().clone();
    assert_eq!(log.len(), 6);
    assert!(log[..4].contains(&"loop".to_string()));
    assert_eq!(&log[4..], &["queue".to_string(), "storage".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_forces_stuck_background_task() {
    let token = CancellationToken::new();
    let tasks = BackgroundTasks::new();
    tasks.spawn("ignores-cancel", async {
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let started = Instant::now();
    let report = ShutdownCoordinator::new(token, Duration::from_secs(5))
        .with_tasks(tasks.clone())
        .shutdown()
        .await;

    assert_eq!(report.forced, vec!["background-tasks".to_string()]);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));

    tokio::time::timeout(Duration::from_millis(10), tasks.wait())
        .await
        .expect("aborted task should be gone");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_is_shared_across_steps() {
    let token = CancellationToken::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let tasks = BackgroundTasks::new();
    tasks.spawn("slow-drain", async {
        tokio::time::sleep(Duration::from_secs(3)).await;
    });
    let slow = MockResource::with_delay("queue", Duration::from_secs(3), &log);
    let quick = MockResource::new("storage", &log);

    let started = Instant::now();
    let report = ShutdownCoordinator::new(token, Duration::from_secs(5))
        .with_tasks(tasks)
        .with_hook(slow.clone())
        .with_hook(quick.clone())
        .shutdown()
        .await;

    assert_eq!(report.forced, vec!["queue".to_string()]);
    assert!(slow.forced.load(Ordering::SeqCst));
    assert!(!quick.forced.load(Ordering::SeqCst));
    assert_eq!(*log.lock(), vec!["storage".to_string()]);
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_pool_is_aborted() {
    let token = CancellationToken::new();
    let pool = Arc::new(WorkerPool::new(1, 1));
    pool.submit(std::future::pending::<()>()).await.unwrap();

    let report = ShutdownCoordinator::new(token, Duration::from_secs(1))
        .with_pool(pool.clone())
        .shutdown()
        .await;

    assert_eq!(report.forced, vec!["worker-pool".to_string()]);
    assert!(report.elapsed >= Duration::from_secs(1));
    assert!(report.elapsed < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_pool_drains_before_storage_closes() {
    let token = CancellationToken::new();
    let store = Arc::new(InMemoryStore::new());
    let pool = Arc::new(WorkerPool::new(1, 8));
    let written = Arc::new(AtomicU32::new(0));

    for i in 0..5 {
        let store = store.clone();
        let written = written.clone();
        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if store.insert_message(&format!("m-{}", i)).await.is_ok() {
                written.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();
    }

    let report = ShutdownCoordinator::new(token, Duration::from_secs(5))
        .with_pool(pool)
        .with_hook(Arc::new(StoreShutdown::new(store.clone())))
        .shutdown()
        .await;

    assert!(report.is_clean());
    assert_eq!(written.load(Ordering::SeqCst), 5);
    assert_eq!(store.messages().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_loop_stops_and_queue_closes() {
    let broker = InMemoryBroker::new();
    let token = CancellationToken::new();
    let mut consumer = MessageConsumer::start(
        Arc::new(broker.clone()),
        ConsumerSettings::new("queue_name"),
        token.clone(),
    )
    .await
    .unwrap();
    let handle = consumer.handle();

    let tasks = BackgroundTasks::new();
    tasks.spawn("consumer", async move {
        while let Some(delivery) = consumer.next_delivery().await {
            let _ = delivery.ack().await;
        }
    });

    let report = ShutdownCoordinator::new(token, Duration::from_secs(5))
        .with_tasks(tasks)
        .with_hook(Arc::new(handle.clone()))
        .shutdown()
        .await;

    assert!(report.is_clean());
    assert!(!handle.is_connected());
    assert_eq!(broker.stats().connects, 1);
}
