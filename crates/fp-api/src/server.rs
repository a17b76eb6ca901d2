//! Serving a router until the shared token is cancelled.

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((host, port)).await
}

/// Serve `router` on `listener`. In-flight requests finish after the token is
/// cancelled; the caller bounds that wait with its shutdown deadline.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(server = name, addr = %addr, "HTTP server listening");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    match result {
        Ok(()) => info!(server = name, "HTTP server shutdown complete"),
        Err(e) => error!(server = name, error = %e, "HTTP server error"),
    }
}
