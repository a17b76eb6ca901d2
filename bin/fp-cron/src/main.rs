//! Failover Pipeline Scheduled Jobs
//!
//! Runs the order report on a fixed interval until shutdown.

use std::sync::Arc;

use anyhow::Context;
use fp_api::{bind, health_router, serve, HealthState, MemoryCheck, StoreProbe};
use fp_config::AppConfig;
use fp_core::{BackgroundTasks, OrderService, Scheduler, ShutdownCoordinator, StoreShutdown};
use fp_queue::{amqp::AmqpConnector, ReconnectingPublisher};
use fp_storage::{MessageStore, MongoStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fp_common::logging::init_logging("fp-cron");

    info!("Starting Failover Pipeline scheduler");

    let config = AppConfig::load()?;
    info!(
        interval_secs = config.scheduler.interval_secs,
        "Scheduler configuration loaded"
    );

    let store: Arc<dyn MessageStore> = Arc::new(
        MongoStore::connect(&config.mongodb)
            .await
            .context("failed to connect to MongoDB")?,
    );
    let publisher = Arc::new(ReconnectingPublisher::new(
        Arc::new(AmqpConnector::new(&config.amqp.uri, "fp-cron")),
        &config.amqp.exchange,
        &config.amqp.routing_key,
    ));
    let service = Arc::new(OrderService::from_config(
        &config,
        store.clone(),
        publisher.clone(),
    ));

    let token = CancellationToken::new();
    let tasks = BackgroundTasks::new();

    let scheduler = Scheduler::new(config.scheduler.interval(), service.clone(), token.clone());
    let job = service.clone();
    tasks.spawn("scheduler", async move {
        let stats = scheduler.run(job).await;
        info!(
            runs = stats.runs,
            skipped = stats.skipped,
            failures = stats.failures,
            "Scheduler loop stopped"
        );
    });

    if config.health.enabled {
        let state = HealthState::new(MemoryCheck::from(&config.health)).with_probe(Arc::new(
            StoreProbe::new(store.clone(), config.mongodb.ping_timeout()),
        ));
        let listener = bind(&config.health.host, config.health.port).await?;
        tasks.spawn(
            "health-server",
            serve("health", listener, health_router(state), token.clone()),
        );
    }

    fp_common::signal::cancel_on_signal(token.clone()).await;

    let report = ShutdownCoordinator::new(token, config.shutdown.cron_deadline())
        .with_tasks(tasks)
        .with_pool(service.pool().clone())
        .with_hook(publisher)
        .with_hook(Arc::new(StoreShutdown::new(store)))
        .shutdown()
        .await;

    if report.is_clean() {
        info!(elapsed_ms = report.elapsed.as_millis() as u64, "Scheduler stopped");
    } else {
        warn!(forced = ?report.forced, "Scheduler stopped with forced shutdown");
    }
    Ok(())
}
