//! Order API.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use fp_core::{CoreError, OrderService};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("orderID is required")]
    MissingOrderId,

    #[error("service is shutting down")]
    Unavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingOrderId => StatusCode::BAD_REQUEST,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Pool(_) => ApiError::Unavailable,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderQuery {
    #[serde(rename = "orderID")]
    pub order_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub message: String,
    #[serde(rename = "orderID")]
    pub order_id: String,
}

/// `POST /create-order?orderID=<id>`. Answers once the side effects are
/// queued, not when they finish.
pub async fn create_order(
    State(service): State<Arc<OrderService>>,
    Query(query): Query<CreateOrderQuery>,
) -> Result<Json<CreateOrderResponse>, ApiError> {
    let order_ref = query
        .order_id
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::MissingOrderId)?;

    let event_id = service.create_order(&order_ref).await?;
    info!(order = %order_ref, event_id = %event_id, "Order accepted");

    Ok(Json(CreateOrderResponse {
        message: "Order created".to_string(),
        order_id: order_ref,
    }))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Unknown panic".to_string());
    error!(panic_msg = %message, "Recovered from panic in HTTP handler");
    ApiError::Internal("Internal Server Error".to_string()).into_response()
}

/// Turn handler panics into `500` responses.
pub fn recover_panics(router: Router) -> Router {
    router.layer(CatchPanicLayer::custom(panic_response))
}

pub fn order_router(service: Arc<OrderService>) -> Router {
    let router = Router::new()
        .route("/create-order", post(create_order))
        .with_state(service);
    recover_panics(router).layer(TraceLayer::new_for_http())
}
