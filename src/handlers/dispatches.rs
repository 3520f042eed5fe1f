use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    models::Destination,
    services::dispatch::{BookingResult, DispatchResponse, VerifyOtpResponse},
    ApiResponse, ApiResult, AppState,
};

use super::{actor_from_headers, claimed_pharmacy, require_idempotency_key};

#[derive(Debug, Deserialize)]
pub struct BookDispatchRequest {
    pub destination: Destination,
}

/// POST /api/v1/orders/:id/dispatch — books a courier for a paid order.
pub async fn book_dispatch(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<BookDispatchRequest>,
) -> ApiResult<BookingResult> {
    let key = require_idempotency_key(&headers)?;
    let actor = actor_from_headers(&headers);
    let pharmacy = claimed_pharmacy(&headers);
    let booking = state
        .services
        .dispatches
        .book(order_id, request.destination, actor, pharmacy, &key)
        .await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/v1/orders/:id/dispatch/quote
pub async fn quote_dispatch(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<BookDispatchRequest>,
) -> ApiResult<DispatchResponse> {
    let actor = actor_from_headers(&headers);
    let pharmacy = claimed_pharmacy(&headers);
    let dispatch = state
        .services
        .dispatches
        .quote(order_id, request.destination, actor, pharmacy)
        .await?;
    Ok(Json(ApiResponse::success(dispatch)))
}

/// GET /api/v1/dispatches/:id
pub async fn get_dispatch(
    State(state): State<AppState>,
    Path(dispatch_id): Path<Uuid>,
) -> ApiResult<DispatchResponse> {
    let dispatch = state.services.dispatches.get_dispatch(dispatch_id)?;
    Ok(Json(ApiResponse::success(dispatch)))
}

#[derive(Debug, Deserialize)]
pub struct VerifyOtpRequest {
    pub code: String,
}

/// POST /api/v1/dispatches/:id/verify-otp — confirms physical handoff.
pub async fn verify_otp(
    State(state): State<AppState>,
    Path(dispatch_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<VerifyOtpRequest>,
) -> ApiResult<VerifyOtpResponse> {
    let key = require_idempotency_key(&headers)?;
    let result = state
        .services
        .dispatches
        .verify_otp(dispatch_id, &request.code, &key)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}

/// POST /api/v1/dispatches/:id/cancel
pub async fn cancel_dispatch(
    State(state): State<AppState>,
    Path(dispatch_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<DispatchResponse> {
    let actor = actor_from_headers(&headers);
    let pharmacy = claimed_pharmacy(&headers);
    let dispatch = state
        .services
        .dispatches
        .cancel(dispatch_id, actor, pharmacy)
        .await?;
    Ok(Json(ApiResponse::success(dispatch)))
}
