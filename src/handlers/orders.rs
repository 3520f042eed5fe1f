use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    models::TransitionRecord,
    services::orders::{CreateOrderRequest, OrderListFilter, OrderResponse},
    ApiResponse, ApiResult, AppState, PaginatedResponse,
};

use super::{actor_from_headers, claimed_pharmacy, require_idempotency_key};

/// POST /api/v1/orders
pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateOrderRequest>,
) -> ApiResult<OrderResponse> {
    let key = require_idempotency_key(&headers)?;
    let order = state.services.orders.create_order(request, &key).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// GET /api/v1/orders
pub async fn list_orders(
    State(state): State<AppState>,
    Query(filter): Query<OrderListFilter>,
) -> ApiResult<PaginatedResponse<OrderResponse>> {
    let page = filter.page.unwrap_or(1).max(1);
    let limit = filter.limit.unwrap_or(20).clamp(1, 100);
    let (items, total) = state.services.orders.list_orders(&filter);
    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page,
        limit,
    })))
}

/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderResponse> {
    let order = state.services.orders.get_order(order_id)?;
    Ok(Json(ApiResponse::success(order)))
}

/// GET /api/v1/orders/:id/history
pub async fn get_order_history(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Vec<TransitionRecord>> {
    let history = state.services.orders.get_history(order_id)?;
    Ok(Json(ApiResponse::success(history)))
}

/// POST /api/v1/orders/:id/confirm
pub async fn confirm_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<OrderResponse> {
    let actor = actor_from_headers(&headers);
    let pharmacy = claimed_pharmacy(&headers);
    let order = state
        .services
        .orders
        .confirm(order_id, actor, pharmacy)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// POST /api/v1/orders/:id/prepare
pub async fn prepare_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<OrderResponse> {
    let actor = actor_from_headers(&headers);
    let pharmacy = claimed_pharmacy(&headers);
    let order = state
        .services
        .orders
        .mark_prepared(order_id, actor, pharmacy)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub reason: String,
}

/// POST /api/v1/orders/:id/cancel
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<CancelOrderRequest>,
) -> ApiResult<OrderResponse> {
    let actor = actor_from_headers(&headers);
    let pharmacy = claimed_pharmacy(&headers);
    let order = state
        .services
        .orders
        .cancel(order_id, &request.reason, actor, pharmacy)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Resolves an order identifier that may be a UUID or an order code scoped by
/// the caller's pharmacy header.
pub async fn get_order_by_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> ApiResult<OrderResponse> {
    let pharmacy = claimed_pharmacy(&headers).ok_or_else(|| {
        ServiceError::ValidationError("x-pharmacy-id header is required for code lookup".into())
    })?;
    let filter = OrderListFilter {
        pharmacy_id: Some(pharmacy),
        ..Default::default()
    };
    let (orders, _) = state.services.orders.list_orders(&filter);
    let order = orders
        .into_iter()
        .find(|o| o.order_code == code)
        .ok_or_else(|| ServiceError::NotFound(format!("order with code {code} not found")))?;
    Ok(Json(ApiResponse::success(order)))
}
