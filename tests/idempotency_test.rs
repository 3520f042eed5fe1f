//! Idempotency guard semantics for client-initiated mutations.

mod common;

use assert_matches::assert_matches;
use common::*;
use pharmaflow_api::errors::ServiceError;
use uuid::Uuid;

#[tokio::test]
async fn create_order_with_same_key_returns_the_same_order() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();

    let first = state
        .services
        .orders
        .create_order(order_request(pharmacy, "IDEMORD-1"), "create-key-1")
        .await
        .unwrap();
    // The retry even carries a different code; the stored result wins.
    let second = state
        .services
        .orders
        .create_order(order_request(pharmacy, "IDEMORD-2"), "create-key-1")
        .await
        .unwrap();

    assert_eq!(first.order_id, second.order_id);
    assert_eq!(second.order_code, "IDEMORD-1");
    assert_eq!(state.store.order_count(), 1);
}

#[tokio::test]
async fn distinct_keys_create_distinct_orders() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();

    let first = state
        .services
        .orders
        .create_order(order_request(pharmacy, "DIST-1"), "create-key-a")
        .await
        .unwrap();
    let second = state
        .services
        .orders
        .create_order(order_request(pharmacy, "DIST-2"), "create-key-b")
        .await
        .unwrap();

    assert_ne!(first.order_id, second.order_id);
    assert_eq!(state.store.order_count(), 2);
}

#[tokio::test]
async fn duplicate_order_code_is_rejected_for_fresh_keys() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();

    state
        .services
        .orders
        .create_order(order_request(pharmacy, "CODE-1"), "code-key-1")
        .await
        .unwrap();
    let err = state
        .services
        .orders
        .create_order(order_request(pharmacy, "CODE-1"), "code-key-2")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn verify_otp_replay_returns_stored_result_without_reexecution() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let (_, dispatch_id, otp) = booked_order(&state, pharmacy, "VOIDEM-1").await;

    for (i, status) in [
        pharmaflow_api::models::DispatchStatus::Assigned,
        pharmaflow_api::models::DispatchStatus::PickedUp,
        pharmaflow_api::models::DispatchStatus::InTransit,
    ]
    .into_iter()
    .enumerate()
    {
        state
            .services
            .reconciliation
            .apply(
                pharmaflow_api::services::reconciliation::InboundEvent::DispatchStatus {
                    source_event_id: format!("evt-vi-{i}"),
                    dispatch_id,
                    status,
                    driver_phone_masked: None,
                    tracking_url: None,
                    at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
    }

    let first = state
        .services
        .dispatches
        .verify_otp(dispatch_id, &otp, "verify-key-1")
        .await
        .unwrap();
    assert!(first.success);

    // The dispatch is now DELIVERED and the OTP consumed; a retry with the
    // same key must replay the stored success instead of failing.
    let replay = state
        .services
        .dispatches
        .verify_otp(dispatch_id, &otp, "verify-key-1")
        .await
        .unwrap();
    assert!(replay.success);

    // A fresh key against the consumed OTP is a state error, proving the
    // replay did not re-execute.
    let err = state
        .services
        .dispatches
        .verify_otp(dispatch_id, &otp, "verify-key-2")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition { .. });
}
