//! Pharmaflow API Library
//!
//! Authoritative core of the pharmacy-operations platform: the order
//! fulfillment lifecycle, courier dispatch tracking, and settlement.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod idempotency;
pub mod models;
pub mod provider;
pub mod rate_limiter;
pub mod request_id;
pub mod services;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::events::{Event, EventSender, StateChangeNotice};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: config::AppConfig,
    pub store: Arc<store::StateStore>,
    pub event_sender: EventSender,
    /// Real-time push fan-out: one notice per committed transition.
    pub push: broadcast::Sender<StateChangeNotice>,
    /// Cached aggregate views; invalidated by the bridge and the event loop.
    pub aggregate_cache: Arc<cache::AggregateCache>,
    pub services: handlers::AppServices,
}

/// Common response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            request_id: request_id::current_request_id(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

/// Standard API result type for JSON responses.
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Builds the full application state from configuration and a courier
/// provider. Returns the event receiver so the caller can spawn
/// `events::process_events` on its runtime (tests drive it directly).
pub fn build_state(
    config: config::AppConfig,
    courier: Arc<dyn provider::CourierProvider>,
) -> (AppState, mpsc::Receiver<Event>) {
    let store = Arc::new(store::StateStore::new());
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = EventSender::new(event_tx);
    let (push_tx, _) = broadcast::channel(256);

    let aggregate_cache = Arc::new(cache::AggregateCache::new(Some(Duration::from_secs(
        config.cache_ttl_secs,
    ))));
    let idempotency = Arc::new(idempotency::IdempotencyGuard::new(Duration::from_secs(
        config.idempotency_retention_secs,
    )));
    let otp_limiter = Arc::new(rate_limiter::RateLimiter::new(
        rate_limiter::RateLimitConfig {
            attempts_per_window: config.otp_max_attempts,
            window: Duration::from_secs(config.otp_window_secs),
        },
    ));
    let breaker = Arc::new(circuit_breaker::CircuitBreaker::new(
        circuit_breaker::CircuitBreakerConfig::default(),
    ));

    let orders = services::orders::OrderService::new(
        store.clone(),
        event_sender.clone(),
        idempotency.clone(),
    );
    let dispatches = services::dispatch::DispatchService::new(
        store.clone(),
        event_sender.clone(),
        orders.clone(),
        courier,
        breaker,
        otp_limiter,
        idempotency.clone(),
        Duration::from_secs(config.provider_timeout_secs),
    );
    let settlements = services::settlement::SettlementService::new(
        store.clone(),
        aggregate_cache.clone(),
        config.platform_fee_bps,
    );
    let payouts = services::payouts::PayoutService::new(
        store.clone(),
        event_sender.clone(),
        config.platform_fee_bps,
    );
    let reconciliation = services::reconciliation::ReconciliationBridge::new(
        orders.clone(),
        dispatches.clone(),
        aggregate_cache.clone(),
        Duration::from_secs(config.event_dedup_retention_secs),
    );

    let state = AppState {
        config,
        store,
        event_sender,
        push: push_tx,
        aggregate_cache,
        services: handlers::AppServices {
            orders,
            dispatches,
            settlements,
            payouts,
            reconciliation,
            idempotency,
        },
    };
    (state, event_rx)
}

/// The versioned API surface.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        // Orders
        .route("/orders", post(handlers::orders::create_order))
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/by-code/:code",
            get(handlers::orders::get_order_by_code),
        )
        .route(
            "/orders/:id/history",
            get(handlers::orders::get_order_history),
        )
        .route("/orders/:id/confirm", post(handlers::orders::confirm_order))
        .route("/orders/:id/prepare", post(handlers::orders::prepare_order))
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        // Dispatch
        .route(
            "/orders/:id/dispatch",
            post(handlers::dispatches::book_dispatch),
        )
        .route(
            "/orders/:id/dispatch/quote",
            post(handlers::dispatches::quote_dispatch),
        )
        .route(
            "/dispatches/:id",
            get(handlers::dispatches::get_dispatch),
        )
        .route(
            "/dispatches/:id/verify-otp",
            post(handlers::dispatches::verify_otp),
        )
        .route(
            "/dispatches/:id/cancel",
            post(handlers::dispatches::cancel_dispatch),
        )
        // Inbound events
        .route(
            "/webhooks/dispatch",
            post(handlers::webhooks::dispatch_webhook),
        )
        .route(
            "/webhooks/payment",
            post(handlers::webhooks::payment_webhook),
        )
        // Read models
        .route(
            "/settlements/summary",
            get(handlers::settlements::settlement_summary),
        )
        .route(
            "/dashboard/stats",
            get(handlers::settlements::dashboard_stats),
        )
        // Payouts
        .route("/payouts", post(handlers::payouts::initiate_payout))
        .route("/payouts", get(handlers::payouts::list_payouts))
        .route(
            "/payouts/:id/initiate",
            post(handlers::payouts::mark_payout_initiated),
        )
        .route(
            "/payouts/:id/complete",
            post(handlers::payouts::complete_payout),
        )
        .route("/payouts/:id/fail", post(handlers::payouts::fail_payout))
}
