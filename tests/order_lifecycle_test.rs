//! End-to-end order lifecycle: creation through OTP-confirmed delivery and
//! the settlement figures that fall out of it.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use pharmaflow_api::{
    errors::ServiceError,
    models::{DispatchStatus, OrderStatus, SettlementWindow},
    services::reconciliation::{InboundEvent, ReconcileOutcome},
};
use uuid::Uuid;

fn today_window() -> SettlementWindow {
    let now = Utc::now();
    SettlementWindow {
        start: now - ChronoDuration::hours(1),
        end: now + ChronoDuration::hours(1),
    }
}

#[tokio::test]
async fn full_flow_from_chat_to_delivery() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let (order_id, dispatch_id, otp) = booked_order(&state, pharmacy, "FLOW-1").await;

    let order = state.services.orders.get_order(order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Dispatched);
    assert_eq!(order.dispatch_id, Some(dispatch_id));
    assert_eq!(order.medication_total_minor, 350_000);
    assert_eq!(order.grand_total_minor, 550_000);

    // Courier progress arrives via the bridge.
    for (i, status) in [
        DispatchStatus::Assigned,
        DispatchStatus::PickedUp,
        DispatchStatus::InTransit,
    ]
    .into_iter()
    .enumerate()
    {
        let outcome = state
            .services
            .reconciliation
            .apply(InboundEvent::DispatchStatus {
                source_event_id: format!("evt-flow-{i}"),
                dispatch_id,
                status,
                driver_phone_masked: Some("+234*****1234".into()),
                tracking_url: None,
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);
    }

    let order = state.services.orders.get_order(order_id).unwrap();
    assert_eq!(order.status, OrderStatus::InTransit);

    // OTP-gated delivery confirmation.
    let result = state
        .services
        .dispatches
        .verify_otp(dispatch_id, &otp, "verify-flow-1")
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.dispatch.status, DispatchStatus::Delivered);
    assert!(result.dispatch.otp_verified_at.is_some());

    let order = state.services.orders.get_order(order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Delivered);
    assert!(order.delivered_at.is_some());

    // The recorded history is gapless and ordered.
    let history = state.services.orders.get_history(order_id).unwrap();
    let path: Vec<(OrderStatus, OrderStatus)> =
        history.iter().map(|r| (r.from, r.to)).collect();
    assert_eq!(
        path,
        vec![
            (OrderStatus::Pending, OrderStatus::Confirmed),
            (OrderStatus::Confirmed, OrderStatus::Prepared),
            (OrderStatus::Prepared, OrderStatus::Paid),
            (OrderStatus::Paid, OrderStatus::Dispatched),
            (OrderStatus::Dispatched, OrderStatus::InTransit),
            (OrderStatus::InTransit, OrderStatus::Delivered),
        ]
    );

    // Give the event loop a beat to invalidate cached aggregates.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Settlement: gross 350_000, 5% fee 17_500, net 332_500.
    let snapshot = state
        .services
        .settlements
        .summary(today_window(), None)
        .unwrap();
    assert_eq!(snapshot.totals.gross_volume_minor, 350_000);
    assert_eq!(snapshot.totals.platform_fee_minor, 17_500);
    assert_eq!(snapshot.totals.net_payable_minor, 332_500);
    assert_eq!(snapshot.per_pharmacy[&pharmacy].gross_volume_minor, 350_000);
}

#[tokio::test]
async fn confirm_is_rejected_on_terminal_orders() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let order = state
        .services
        .orders
        .create_order(order_request(pharmacy, "TERM-1"), "key-term-1")
        .await
        .unwrap();

    state
        .services
        .orders
        .cancel(order.order_id, "patient unreachable", staff(), Some(pharmacy))
        .await
        .unwrap();

    let err = state
        .services
        .orders
        .confirm(order.order_id, staff(), Some(pharmacy))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition { .. });
}

#[tokio::test]
async fn preparation_requires_priced_items() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let mut request = order_request(pharmacy, "PRICE-1");
    request.items[1].unit_price_minor = 0;
    let order = state
        .services
        .orders
        .create_order(request, "key-price-1")
        .await
        .unwrap();

    state
        .services
        .orders
        .confirm(order.order_id, staff(), Some(pharmacy))
        .await
        .unwrap();

    let err = state
        .services
        .orders
        .mark_prepared(order.order_id, staff(), Some(pharmacy))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn cancellation_requires_a_reason() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let order = state
        .services
        .orders
        .create_order(order_request(pharmacy, "REASON-1"), "key-reason-1")
        .await
        .unwrap();

    let err = state
        .services
        .orders
        .cancel(order.order_id, "   ", staff(), Some(pharmacy))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn cancellation_is_forbidden_once_dispatched() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let (order_id, _, _) = booked_order(&state, pharmacy, "NOCANCEL-1").await;

    let err = state
        .services
        .orders
        .cancel(order_id, "changed mind", staff(), Some(pharmacy))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let order = state.services.orders.get_order(order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Dispatched);
}

#[tokio::test]
async fn other_pharmacies_cannot_mutate_the_order() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let order = state
        .services
        .orders
        .create_order(order_request(pharmacy, "OWN-1"), "key-own-1")
        .await
        .unwrap();

    let err = state
        .services
        .orders
        .confirm(order.order_id, staff(), Some(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotParticipant(_));

    // Admins bypass the ownership check.
    state
        .services
        .orders
        .confirm(order.order_id, admin(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_payment_callback_is_a_noop() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let order_id = paid_order(&state, pharmacy, "DUPPAY-1").await;

    let before = state.services.orders.get_order(order_id).unwrap();
    let replay = state
        .services
        .orders
        .record_payment(order_id, "pay-DUPPAY-1")
        .await
        .unwrap();
    assert_eq!(replay.status, OrderStatus::Paid);
    assert_eq!(replay.paid_at, before.paid_at);

    // Only one PREPARED -> PAID transition in the history.
    let history = state.services.orders.get_history(order_id).unwrap();
    let paid_transitions = history
        .iter()
        .filter(|r| r.to == OrderStatus::Paid)
        .count();
    assert_eq!(paid_transitions, 1);
}

#[tokio::test]
async fn payment_callback_on_unprepared_order_is_rejected() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let order = state
        .services
        .orders
        .create_order(order_request(pharmacy, "EARLY-1"), "key-early-1")
        .await
        .unwrap();

    let err = state
        .services
        .orders
        .record_payment(order.order_id, "pay-early")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition { .. });
}
