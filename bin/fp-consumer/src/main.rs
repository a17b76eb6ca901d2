//! Failover Pipeline Queue Consumer
//!
//! Consumes the order queue, records each message and survives broker
//! restarts. Exposes `/health` when enabled.

use std::sync::Arc;

use anyhow::Context;
use fp_api::{bind, health_router, serve, HealthState, MemoryCheck, StoreProbe};
use fp_config::AppConfig;
use fp_core::{
    BackgroundTasks, ConsumerSettings, DeliveryProcessor, MessageConsumer, OrderService,
    ShutdownCoordinator, ShutdownHook, StoreShutdown,
};
use fp_queue::{amqp::AmqpConnector, QueueConnector, ReconnectingPublisher};
use fp_storage::{MessageStore, MongoStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fp_common::logging::init_logging("fp-consumer");

    info!("Starting Failover Pipeline consumer");

    let config = AppConfig::load()?;
    info!(
        queue = %config.amqp.queue_name,
        reconnect_delay_secs = config.amqp.reconnect_delay_secs,
        "Configuration loaded"
    );

    // 1. Storage must be reachable before anything is consumed
    let store: Arc<dyn MessageStore> = Arc::new(
        MongoStore::connect(&config.mongodb)
            .await
            .context("failed to connect to MongoDB")?,
    );

    // 2. Broker connection and outbound publisher
    let connector: Arc<dyn QueueConnector> =
        Arc::new(AmqpConnector::new(&config.amqp.uri, "fp-consumer"));
    let publisher = Arc::new(ReconnectingPublisher::new(
        connector.clone(),
        &config.amqp.exchange,
        &config.amqp.routing_key,
    ));

    let service = Arc::new(OrderService::from_config(
        &config,
        store.clone(),
        publisher.clone(),
    ));

    // 3. Subscribe. Failing here exits the process; later losses reconnect.
    let token = CancellationToken::new();
    let mut consumer = MessageConsumer::start(
        connector,
        ConsumerSettings::from(&config.amqp),
        token.clone(),
    )
    .await?;
    let queue = Arc::new(consumer.handle());

    let tasks = BackgroundTasks::new();
    let processor = DeliveryProcessor::new(service.clone(), service.clone(), token.clone());
    tasks.spawn("consumer", async move {
        let settled = processor.run(&mut consumer).await;
        info!(settled, "Consumer loop stopped");
    });

    // 4. Health endpoint
    if config.health.enabled {
        let state = HealthState::new(MemoryCheck::from(&config.health))
            .with_probe(Arc::new(StoreProbe::new(
                store.clone(),
                config.mongodb.ping_timeout(),
            )))
            .with_probe(queue.clone());
        let listener = bind(&config.health.host, config.health.port).await?;
        tasks.spawn(
            "health-server",
            serve("health", listener, health_router(state), token.clone()),
        );
    }

    info!("Consumer running, waiting for shutdown signal");
    fp_common::signal::cancel_on_signal(token.clone()).await;

    // 5. Tear down within the deadline
    let report = ShutdownCoordinator::new(token, config.shutdown.consumer_deadline())
        .with_tasks(tasks)
        .with_pool(service.pool().clone())
        .with_hook(queue as Arc<dyn ShutdownHook>)
        .with_hook(publisher)
        .with_hook(Arc::new(StoreShutdown::new(store)))
        .shutdown()
        .await;

    if report.is_clean() {
        info!(elapsed_ms = report.elapsed.as_millis() as u64, "Consumer stopped");
    } else {
        warn!(forced = ?report.forced, "Consumer stopped with forced shutdown");
    }
    Ok(())
}
