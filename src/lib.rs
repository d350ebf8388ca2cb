//! Order placement and inventory consistency pipeline.
//!
//! Checkout sessions reserve stock, order placement is guarded by a durable
//! idempotency ledger, and every side effect that leaves the database goes
//! through the transactional outbox.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod middleware_helpers;
pub mod services;
pub mod tracing;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, middleware, response::Json, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::errors::ErrorBody;
use crate::gateway::PaymentGateway;
use crate::middleware_helpers::retry::RetryConfig;
use crate::services::{CartSource, SettlementSignal};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub services: handlers::AppServices,
    pub retry: RetryConfig,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        cart: Arc<dyn CartSource>,
        gateway: Arc<dyn PaymentGateway>,
        settlement: SettlementSignal,
    ) -> Self {
        let services = handlers::AppServices::new(db.clone(), &config, cart, gateway, settlement);
        let retry = config.retry_config();
        Self {
            db,
            config,
            services,
            retry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Uniform envelope: `{status, data, error}` with exactly one of `data` and
/// `error` set.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: ResponseStatus,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorBody) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: None,
            error: Some(error),
        }
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .nest("/checkout", handlers::checkout::router())
        .nest("/orders", handlers::orders::router())
        .nest("/payments", handlers::payment_webhooks::router())
        .nest("/admin/outbox", handlers::outbox_admin::router())
}

/// Full application router with the request-scoped layers.
pub fn app_router(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(30);
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http().make_span_with(crate::tracing::RequestSpanMaker))
        .layer(middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let db_status = match state.db.ping().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };
    Ok(Json(ApiResponse::success(json!({
        "status": db_status,
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
        "timestamp": Utc::now().to_rfc3339(),
    }))))
}

#[cfg(test)]
mod response_tests {
    use super::*;

    #[test]
    fn success_envelope_has_null_error() {
        let value = serde_json::to_value(ApiResponse::success(json!({"id": 1}))).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"]["id"], 1);
        assert!(value["error"].is_null());
    }

    #[test]
    fn error_envelope_has_null_data() {
        let body = ErrorBody {
            code: "checkout_expired".into(),
            message: "Checkout expired: gone".into(),
            request_id: None,
        };
        let value = serde_json::to_value(ApiResponse::<()>::error(body)).unwrap();
        assert_eq!(value["status"], "error");
        assert!(value["data"].is_null());
        assert_eq!(value["error"]["code"], "checkout_expired");
    }
}
