//! HTTP surfaces of the failover pipeline.
//!
//! - Order API: `POST /create-order`
//! - Health endpoint: `GET /health`, gated on collaborator liveness and
//!   cgroup memory pressure

pub mod health;
pub mod memory;
pub mod orders;
pub mod server;

pub use health::{health_router, HealthState, HealthStatus, LivenessProbe, StoreProbe};
pub use memory::{is_in_low_memory, CgroupMemoryGetter, MemoryCheck, MemoryError, MemoryGetter};
pub use orders::{order_router, recover_panics, ApiError};
pub use server::{bind, serve};
