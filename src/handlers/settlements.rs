use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    models::{SettlementSnapshot, SettlementWindow},
    services::settlement::DashboardCounts,
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub start_date: NaiveDate,
    /// Inclusive: the whole end day is part of the window.
    pub end_date: NaiveDate,
    pub pharmacy_id: Option<Uuid>,
}

/// GET /api/v1/settlements/summary?start_date=..&end_date=..&pharmacy_id=..
pub async fn settlement_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<SettlementSnapshot> {
    let start = Utc.from_utc_datetime(&query.start_date.and_hms_opt(0, 0, 0).unwrap());
    let end = Utc.from_utc_datetime(
        &query
            .end_date
            .succ_opt()
            .unwrap_or(query.end_date)
            .and_hms_opt(0, 0, 0)
            .unwrap(),
    );

    let window = SettlementWindow { start, end };
    let snapshot = state
        .services
        .settlements
        .summary(window, query.pharmacy_id)?;
    Ok(Json(ApiResponse::success(snapshot)))
}

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    pub pharmacy_id: Option<Uuid>,
}

/// GET /api/v1/dashboard/stats
pub async fn dashboard_stats(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<DashboardCounts> {
    let counts = state.services.settlements.dashboard_counts(query.pharmacy_id);
    Ok(Json(ApiResponse::success(counts)))
}
