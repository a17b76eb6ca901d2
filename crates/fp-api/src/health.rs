//! Health endpoint.
//!
//! `GET /health` answers `200 {"status":"healthy"}` only when every
//! registered collaborator is up and the process is not under memory
//! pressure; otherwise `503 {"status":"unhealthy"}`.

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use fp_common::Liveness;
use fp_core::ConsumerHandle;
use fp_storage::MessageStore;

use crate::memory::MemoryCheck;

/// A collaborator whose liveness gates the health endpoint.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn liveness(&self) -> Liveness;
}

#[async_trait]
impl LivenessProbe for ConsumerHandle {
    fn name(&self) -> &str {
        "queue"
    }

    async fn liveness(&self) -> Liveness {
        self.is_connected().into()
    }
}

/// Storage reachability via a bounded ping.
pub struct StoreProbe {
    store: Arc<dyn MessageStore>,
    timeout: Duration,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn MessageStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl LivenessProbe for StoreProbe {
    fn name(&self) -> &str {
        "storage"
    }

    async fn liveness(&self) -> Liveness {
        self.store.ping(self.timeout).await.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
}

#[derive(Clone)]
pub struct HealthState {
    probes: Vec<Arc<dyn LivenessProbe>>,
    memory: MemoryCheck,
}

impl HealthState {
    pub fn new(memory: MemoryCheck) -> Self {
        Self {
            probes: Vec::new(),
            memory,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub async fn status(&self) -> HealthStatus {
        for probe in &self.probes {
            if !probe.liveness().await.is_up() {
                warn!(collaborator = probe.name(), "Health check failed: collaborator down");
                return HealthStatus::Unhealthy;
            }
        }

        match self.memory.is_low() {
            Ok(false) => HealthStatus::Healthy,
            Ok(true) => {
                warn!("Health check failed: low memory");
                HealthStatus::Unhealthy
            }
            Err(e) => {
                warn!(error = %e, "Health check failed: memory probe error");
                HealthStatus::Unhealthy
            }
        }
    }
}

pub async fn get_health(State(state): State<HealthState>) -> Response {
    let status = state.status().await;
    let code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(HealthResponse { status })).into_response()
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .with_state(state)
}
