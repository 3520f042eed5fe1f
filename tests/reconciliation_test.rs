//! Reconciliation bridge behavior: webhook dedup, stale-event absorption and
//! cache invalidation.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use pharmaflow_api::{
    models::{DispatchStatus, OrderStatus, SettlementWindow},
    services::reconciliation::{InboundEvent, ReconcileOutcome},
};
use uuid::Uuid;

fn dispatch_event(dispatch_id: Uuid, status: DispatchStatus, event_id: &str) -> InboundEvent {
    InboundEvent::DispatchStatus {
        source_event_id: event_id.to_string(),
        dispatch_id,
        status,
        driver_phone_masked: None,
        tracking_url: None,
        at: Utc::now(),
    }
}

fn wide_window() -> SettlementWindow {
    let now = Utc::now();
    SettlementWindow {
        start: now - ChronoDuration::hours(1),
        end: now + ChronoDuration::hours(1),
    }
}

#[tokio::test]
async fn replayed_events_are_absorbed_once() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let (_, dispatch_id, _) = booked_order(&state, pharmacy, "REPLAY-1").await;

    let first = state
        .services
        .reconciliation
        .apply(dispatch_event(dispatch_id, DispatchStatus::Assigned, "evt-r1"))
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Applied);

    // At-least-once delivery: the same upstream event arrives again.
    let replay = state
        .services
        .reconciliation
        .apply(dispatch_event(dispatch_id, DispatchStatus::Assigned, "evt-r1"))
        .await
        .unwrap();
    assert_eq!(replay, ReconcileOutcome::Duplicate);

    let dispatch = state.services.dispatches.get_dispatch(dispatch_id).unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Assigned);
}

#[tokio::test]
async fn stale_delivery_report_for_canceled_dispatch_is_discarded() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let (order_id, dispatch_id, _) = booked_order(&state, pharmacy, "STALE-1").await;

    state
        .services
        .dispatches
        .cancel(dispatch_id, staff(), Some(pharmacy))
        .await
        .unwrap();

    // The provider still reports DELIVERED for the canceled dispatch.
    // Discarded as stale, no state change, no settlement impact.
    let outcome = state
        .services
        .reconciliation
        .apply(dispatch_event(dispatch_id, DispatchStatus::Delivered, "evt-s1"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Stale);

    let dispatch = state.services.dispatches.get_dispatch(dispatch_id).unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Canceled);
    let order = state.services.orders.get_order(order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Paid);

    let snapshot = state
        .services
        .settlements
        .summary(wide_window(), None)
        .unwrap();
    assert_eq!(snapshot.totals.gross_volume_minor, 0);
}

#[tokio::test]
async fn out_of_order_provider_events_are_stale() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let (_, dispatch_id, _) = booked_order(&state, pharmacy, "ORDER-1").await;

    state
        .services
        .reconciliation
        .apply(dispatch_event(dispatch_id, DispatchStatus::Assigned, "evt-o1"))
        .await
        .unwrap();
    state
        .services
        .reconciliation
        .apply(dispatch_event(dispatch_id, DispatchStatus::PickedUp, "evt-o2"))
        .await
        .unwrap();

    // A late ASSIGNED push (new event id, older state) must not rewind.
    let outcome = state
        .services
        .reconciliation
        .apply(dispatch_event(dispatch_id, DispatchStatus::Assigned, "evt-o3"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Stale);
    let dispatch = state.services.dispatches.get_dispatch(dispatch_id).unwrap();
    assert_eq!(dispatch.status, DispatchStatus::PickedUp);
}

#[tokio::test]
async fn unknown_dispatch_events_are_quarantined() {
    let state = spawn_app();
    let outcome = state
        .services
        .reconciliation
        .apply(dispatch_event(Uuid::new_v4(), DispatchStatus::Assigned, "evt-u1"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Stale);
}

#[tokio::test]
async fn replayed_payment_callback_counts_money_once() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();
    let order = state
        .services
        .orders
        .create_order(order_request(pharmacy, "PAYONCE-1"), "key-payonce-1")
        .await
        .unwrap();
    state
        .services
        .orders
        .confirm(order.order_id, staff(), Some(pharmacy))
        .await
        .unwrap();
    state
        .services
        .orders
        .mark_prepared(order.order_id, staff(), Some(pharmacy))
        .await
        .unwrap();

    let callback = |event_id: &str| InboundEvent::PaymentOutcome {
        source_event_id: event_id.to_string(),
        order_id: order.order_id,
        payment_reference: "gw-ref-77".to_string(),
        success: true,
        at: Utc::now(),
    };

    // The gateway delivers the callback twice.
    let first = state
        .services
        .reconciliation
        .apply(callback("evt-p1"))
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Applied);
    let second = state
        .services
        .reconciliation
        .apply(callback("evt-p1"))
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Duplicate);

    // Same callback under a fresh event id is still a no-op on state.
    let third = state
        .services
        .reconciliation
        .apply(callback("evt-p2"))
        .await
        .unwrap();
    assert_eq!(third, ReconcileOutcome::Applied);

    let history = state.services.orders.get_history(order.order_id).unwrap();
    assert_eq!(
        history
            .iter()
            .filter(|r| r.to == OrderStatus::Paid)
            .count(),
        1
    );

    let snapshot = state
        .services
        .settlements
        .summary(wide_window(), None)
        .unwrap();
    // paid-but-undelivered money shows up exactly once, as pending
    assert_eq!(snapshot.totals.pending_payments_minor, 550_000);
    assert_eq!(snapshot.totals.paid_orders, 1);
}

#[tokio::test]
async fn applied_events_invalidate_cached_aggregates() {
    let state = spawn_app();
    let pharmacy = Uuid::new_v4();

    // Warm the cache while the store is empty.
    let empty = state
        .services
        .settlements
        .summary(wide_window(), None)
        .unwrap();
    assert_eq!(empty.totals.paid_orders, 0);

    let order = state
        .services
        .orders
        .create_order(order_request(pharmacy, "CACHE-1"), "key-cache-1")
        .await
        .unwrap();
    state
        .services
        .orders
        .confirm(order.order_id, staff(), Some(pharmacy))
        .await
        .unwrap();
    state
        .services
        .orders
        .mark_prepared(order.order_id, staff(), Some(pharmacy))
        .await
        .unwrap();

    // Bridge applies the payment and synchronously stales the cache.
    state
        .services
        .reconciliation
        .apply(InboundEvent::PaymentOutcome {
            source_event_id: "evt-c1".into(),
            order_id: order.order_id,
            payment_reference: "gw-ref-c1".into(),
            success: true,
            at: Utc::now(),
        })
        .await
        .unwrap();

    let refreshed = state
        .services
        .settlements
        .summary(wide_window(), None)
        .unwrap();
    assert_eq!(refreshed.totals.paid_orders, 1);
    assert_eq!(refreshed.totals.pending_payments_minor, 550_000);
}
