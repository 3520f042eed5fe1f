//! Inbound webhook surface: courier-provider pushes and payment-gateway
//! callbacks. Both are at-least-once; everything funnels through the
//! reconciliation bridge, which owns dedup and staleness.
//!
//! Payloads are parsed into closed types here at the boundary. Unrecognized
//! status strings or shapes are rejected with a validation error instead of
//! leaking loosely-typed data inward.

use std::str::FromStr;

use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    models::DispatchStatus,
    services::reconciliation::{InboundEvent, ReconcileOutcome},
    ApiResponse, ApiResult, AppState,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Wire shape of a courier-provider status push.
#[derive(Debug, Deserialize)]
struct DispatchWebhookPayload {
    event_id: String,
    dispatch_id: Uuid,
    status: String,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
    #[serde(default)]
    driver_phone_masked: Option<String>,
    #[serde(default)]
    tracking_url: Option<String>,
}

/// Wire shape of a payment-gateway callback.
#[derive(Debug, Deserialize)]
struct PaymentWebhookPayload {
    event_id: String,
    order_id: Uuid,
    payment_reference: String,
    outcome: String,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub outcome: ReconcileOutcome,
}

fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> bool {
    let (Some(ts), Some(sig)) = (
        headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok()),
        headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()),
    ) else {
        return false;
    };

    let Ok(ts_i) = ts.parse::<i64>() else {
        return false;
    };
    let now = Utc::now().timestamp();
    if (now - ts_i).unsigned_abs() > tolerance_secs {
        return false;
    }

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, sig)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

fn authenticate(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), ServiceError> {
    if let Some(secret) = &state.config.webhook_secret {
        if !verify_signature(headers, body, secret, state.config.webhook_tolerance_secs) {
            warn!("webhook signature verification failed");
            return Err(ServiceError::NotParticipant(
                "invalid webhook signature".to_string(),
            ));
        }
    }
    Ok(())
}

/// POST /api/v1/webhooks/dispatch
pub async fn dispatch_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    authenticate(&state, &headers, &body)?;

    let payload: DispatchWebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("malformed webhook payload: {e}")))?;

    let status = DispatchStatus::from_str(&payload.status).map_err(|_| {
        ServiceError::ValidationError(format!(
            "unrecognized dispatch status {:?}",
            payload.status
        ))
    })?;

    let outcome = state
        .services
        .reconciliation
        .apply(InboundEvent::DispatchStatus {
            source_event_id: payload.event_id,
            dispatch_id: payload.dispatch_id,
            status,
            driver_phone_masked: payload.driver_phone_masked,
            tracking_url: payload.tracking_url,
            at: payload.at.unwrap_or_else(Utc::now),
        })
        .await?;

    Ok(Json(ApiResponse::success(WebhookAck { outcome })))
}

/// POST /api/v1/webhooks/payment
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    authenticate(&state, &headers, &body)?;

    let payload: PaymentWebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("malformed callback payload: {e}")))?;

    let success = match payload.outcome.to_ascii_lowercase().as_str() {
        "success" | "succeeded" => true,
        "failed" | "failure" => false,
        other => {
            return Err(ServiceError::ValidationError(format!(
                "unrecognized payment outcome {other:?}"
            )))
        }
    };

    let outcome = state
        .services
        .reconciliation
        .apply(InboundEvent::PaymentOutcome {
            source_event_id: payload.event_id,
            order_id: payload.order_id,
            payment_reference: payload.payment_reference,
            success,
            at: payload.at.unwrap_or_else(Utc::now),
        })
        .await?;

    Ok(Json(ApiResponse::success(WebhookAck { outcome })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let secret = "wh-secret";
        let body = br#"{"event_id":"evt-1"}"#;
        let ts = Utc::now().timestamp().to_string();

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.as_bytes());
        mac.update(b".");
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, ts.parse().unwrap());
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());
        assert!(verify_signature(&headers, body, secret, 300));
        assert!(!verify_signature(&headers, body, "wrong-secret", 300));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let secret = "wh-secret";
        let body = b"{}";
        let ts = (Utc::now().timestamp() - 3600).to_string();

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.as_bytes());
        mac.update(b".");
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, ts.parse().unwrap());
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());
        assert!(!verify_signature(&headers, body, secret, 300));
    }
}
