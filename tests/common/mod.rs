#![allow(dead_code)]

use std::sync::Arc;

use pharmaflow_api::{
    build_state,
    config::AppConfig,
    events,
    models::{Actor, Destination},
    provider::{CourierProvider, StaticCourierProvider},
    services::orders::{CreateOrderRequest, LineItemRequest},
    AppState,
};
use uuid::Uuid;

/// Builds a fully wired application state over the given courier provider
/// and starts the event processing loop on the test runtime.
pub fn spawn_app_with(provider: Arc<dyn CourierProvider>) -> AppState {
    let (state, event_rx) = build_state(AppConfig::default(), provider);
    tokio::spawn(events::process_events(
        event_rx,
        state.push.clone(),
        state.aggregate_cache.clone(),
    ));
    state
}

pub fn spawn_app() -> AppState {
    spawn_app_with(Arc::new(StaticCourierProvider::default()))
}

pub fn staff() -> Actor {
    Actor::PharmacyStaff {
        staff_id: Uuid::new_v4(),
    }
}

pub fn admin() -> Actor {
    Actor::Admin {
        admin_id: Uuid::new_v4(),
    }
}

pub fn destination() -> Destination {
    Destination {
        latitude: 6.5244,
        longitude: 3.3792,
        address: "23 Marina Rd, Lagos Island".into(),
    }
}

/// Standard two-item order: ₦2,000 × 1 + ₦500 × 3 (kobo minor units), so
/// the medication total is 350_000 minor.
pub fn order_request(pharmacy_id: Uuid, code: &str) -> CreateOrderRequest {
    CreateOrderRequest {
        pharmacy_id,
        order_code: code.to_string(),
        origin_context: format!("chat-{code}"),
        items: vec![
            LineItemRequest {
                drug_name: "Amoxicillin 500mg".into(),
                quantity: 1,
                dosage_instructions: "1 capsule three times daily".into(),
                unit_price_minor: 200_000,
            },
            LineItemRequest {
                drug_name: "Paracetamol 500mg".into(),
                quantity: 3,
                dosage_instructions: "2 tablets as needed".into(),
                unit_price_minor: 50_000,
            },
        ],
        delivery_fee_minor: 150_000,
        service_fee_minor: 50_000,
    }
}

/// Drives a fresh order to PAID: create, confirm, prepare, payment callback.
pub async fn paid_order(state: &AppState, pharmacy_id: Uuid, code: &str) -> Uuid {
    let order = state
        .services
        .orders
        .create_order(order_request(pharmacy_id, code), &format!("key-{code}"))
        .await
        .expect("create order");
    let order_id = order.order_id;

    state
        .services
        .orders
        .confirm(order_id, staff(), Some(pharmacy_id))
        .await
        .expect("confirm order");
    state
        .services
        .orders
        .mark_prepared(order_id, staff(), Some(pharmacy_id))
        .await
        .expect("prepare order");
    state
        .services
        .orders
        .record_payment(order_id, &format!("pay-{code}"))
        .await
        .expect("record payment");
    order_id
}

/// Drives an order through booking. Returns (order_id, dispatch_id, otp).
pub async fn booked_order(
    state: &AppState,
    pharmacy_id: Uuid,
    code: &str,
) -> (Uuid, Uuid, String) {
    let order_id = paid_order(state, pharmacy_id, code).await;
    let booking = state
        .services
        .dispatches
        .book(
            order_id,
            destination(),
            staff(),
            Some(pharmacy_id),
            &format!("book-{code}"),
        )
        .await
        .expect("book dispatch");
    (order_id, booking.dispatch.dispatch_id, booking.delivery_code)
}
