//! Failover Pipeline Order API
//!
//! Serves `POST /create-order`; payment, notification and the
//! `order.created` event run on the bounded worker pool.

use std::sync::Arc;

use anyhow::Context;
use fp_api::{bind, health_router, order_router, serve, HealthState, MemoryCheck, StoreProbe};
use fp_config::AppConfig;
use fp_core::{BackgroundTasks, OrderService, ShutdownCoordinator, StoreShutdown};
use fp_queue::{amqp::AmqpConnector, ReconnectingPublisher};
use fp_storage::{MessageStore, MongoStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fp_common::logging::init_logging("fp-http-server");

    info!("Starting Failover Pipeline order API");

    let config = AppConfig::load()?;
    info!(
        port = config.http.port,
        workers = config.worker_pool.workers,
        capacity = config.worker_pool.capacity,
        "Configuration loaded"
    );

    let store: Arc<dyn MessageStore> = Arc::new(
        MongoStore::connect(&config.mongodb)
            .await
            .context("failed to connect to MongoDB")?,
    );

    // The publisher dials lazily on first publish
    let publisher = Arc::new(ReconnectingPublisher::new(
        Arc::new(AmqpConnector::new(&config.amqp.uri, "fp-http-server")),
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

    let listener = bind(&config.http.host, config.http.port).await?;
    tasks.spawn(
        "order-api",
        serve("orders", listener, order_router(service.clone()), token.clone()),
    );

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

    // Servers stop accepting first, then queued side effects drain
    let report = ShutdownCoordinator::new(token, config.shutdown.http_deadline())
        .with_tasks(tasks)
        .with_pool(service.pool().clone())
        .with_hook(publisher)
        .with_hook(Arc::new(StoreShutdown::new(store)))
        .shutdown()
        .await;

    if report.is_clean() {
        info!(elapsed_ms = report.elapsed.as_millis() as u64, "Order API stopped");
    } else {
        warn!(forced = ?report.forced, "Order API stopped with forced shutdown");
    }
    Ok(())
}
