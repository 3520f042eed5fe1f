use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    services::payouts::{InitiatePayoutRequest, PayoutResponse},
    ApiResponse, ApiResult, AppState,
};

use super::actor_from_headers;

/// POST /api/v1/payouts — admin-only; draws against the pharmacy's net
/// payable.
pub async fn initiate_payout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiatePayoutRequest>,
) -> ApiResult<PayoutResponse> {
    let actor = actor_from_headers(&headers);
    let payout = state.services.payouts.initiate(request, actor).await?;
    Ok(Json(ApiResponse::success(payout)))
}

/// POST /api/v1/payouts/:id/initiate — the bank rail accepted the transfer.
pub async fn mark_payout_initiated(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
) -> ApiResult<PayoutResponse> {
    let payout = state.services.payouts.mark_initiated(payout_id).await?;
    Ok(Json(ApiResponse::success(payout)))
}

/// POST /api/v1/payouts/:id/complete
pub async fn complete_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
) -> ApiResult<PayoutResponse> {
    let payout = state.services.payouts.mark_completed(payout_id).await?;
    Ok(Json(ApiResponse::success(payout)))
}

#[derive(Debug, Deserialize)]
pub struct FailPayoutRequest {
    pub reason: String,
}

/// POST /api/v1/payouts/:id/fail
pub async fn fail_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
    Json(request): Json<FailPayoutRequest>,
) -> ApiResult<PayoutResponse> {
    let payout = state
        .services
        .payouts
        .mark_failed(payout_id, &request.reason)
        .await?;
    Ok(Json(ApiResponse::success(payout)))
}

#[derive(Debug, Deserialize)]
pub struct PayoutListQuery {
    pub pharmacy_id: Option<Uuid>,
}

/// GET /api/v1/payouts
pub async fn list_payouts(
    State(state): State<AppState>,
    Query(query): Query<PayoutListQuery>,
) -> ApiResult<Vec<PayoutResponse>> {
    let payouts = state.services.payouts.list_payouts(query.pharmacy_id);
    Ok(Json(ApiResponse::success(payouts)))
}
