//! Resilience core of the failover pipeline.
//!
//! - [`MessageConsumer`]: queue subscription that survives broker restarts
//! - [`DeliveryProcessor`]: idempotent ack/requeue decision per delivery
//! - [`WorkerPool`]: bounded fan-out of side effects
//! - [`CircuitBreaker`] and [`RetryPolicy`]: guards for outbound calls
//! - [`ShutdownCoordinator`]: deadline-bounded teardown

pub mod circuit_breaker;
pub mod consumer;
pub mod error;
pub mod guard;
pub mod processor;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod worker_pool;

pub use circuit_breaker::{
    BreakerError, BreakerSettings, CircuitBreaker, CircuitState, Counts, StateChangeHook,
};
pub use consumer::{ConsumerHandle, ConsumerSettings, MessageConsumer};
pub use error::{CoreError, Result};
pub use guard::{guarded, BackgroundTasks, Fault};
pub use processor::{
    AlwaysProcess, DeliveryProcessor, IdempotencyCheck, MessageHandler, ProcessorStats, Resolution,
};
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::{ScheduledJob, Scheduler, SchedulerStats};
pub use service::{OrderEffects, OrderService, SimulatedEffects};
pub use shutdown::{ShutdownCoordinator, ShutdownHook, ShutdownReport, StoreShutdown};
pub use worker_pool::{PoolError, PoolStats, WorkerPool};
