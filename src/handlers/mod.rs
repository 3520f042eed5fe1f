use std::sync::Arc;

use axum::http::HeaderMap;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    idempotency::IdempotencyGuard,
    models::Actor,
    services::{
        dispatch::DispatchService, orders::OrderService, payouts::PayoutService,
        reconciliation::ReconciliationBridge, settlement::SettlementService,
    },
};

pub mod dispatches;
pub mod orders;
pub mod payouts;
pub mod settlements;
pub mod webhooks;

/// Aggregated services used by the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub dispatches: DispatchService,
    pub settlements: SettlementService,
    pub payouts: PayoutService,
    pub reconciliation: ReconciliationBridge,
    pub idempotency: Arc<IdempotencyGuard>,
}

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const PHARMACY_ID_HEADER: &str = "x-pharmacy-id";
pub const STAFF_ID_HEADER: &str = "x-staff-id";
pub const ADMIN_ID_HEADER: &str = "x-admin-id";

/// Mutating calls must carry an idempotency key; silently proceeding without
/// one risks double-charging or duplicate bookings under client retries.
pub fn require_idempotency_key(headers: &HeaderMap) -> Result<String, ServiceError> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ServiceError::MissingIdempotencyKey)
}

/// Resolves the acting identity from request headers. Full authentication is
/// an upstream concern; this is the ownership seam the core needs.
pub fn actor_from_headers(headers: &HeaderMap) -> Actor {
    if let Some(admin_id) = header_uuid(headers, ADMIN_ID_HEADER) {
        return Actor::Admin { admin_id };
    }
    let staff_id = header_uuid(headers, STAFF_ID_HEADER).unwrap_or_else(Uuid::nil);
    Actor::PharmacyStaff { staff_id }
}

pub fn claimed_pharmacy(headers: &HeaderMap) -> Option<Uuid> {
    header_uuid(headers, PHARMACY_ID_HEADER)
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    #[test]
    fn missing_key_is_rejected() {
        let headers = HeaderMap::new();
        assert_matches!(
            require_idempotency_key(&headers),
            Err(ServiceError::MissingIdempotencyKey)
        );

        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("  "));
        assert_matches!(
            require_idempotency_key(&headers),
            Err(ServiceError::MissingIdempotencyKey)
        );
    }

    #[test]
    fn admin_header_wins_over_staff() {
        let admin = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(
            ADMIN_ID_HEADER,
            HeaderValue::from_str(&admin.to_string()).unwrap(),
        );
        headers.insert(
            STAFF_ID_HEADER,
            HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap(),
        );
        assert_matches!(actor_from_headers(&headers), Actor::Admin { admin_id } if admin_id == admin);
    }
}
