//! Authoritative state store.
//!
//! The rewrite collapses the source system's "optimistic client cache +
//! periodic refetch" into a single in-process source of truth. Entities live
//! in concurrent maps behind this seam; everything above it talks `Result`,
//! so a durable backend can replace the maps without touching the state
//! machines. A failed commit surfaces as `StoreError` and aborts the whole
//! transition — commits are single whole-record writes, never field-level
//! patches.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::models::{Dispatch, Order, PayoutRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order {0} not found")]
    OrderNotFound(Uuid),
    #[error("dispatch {0} not found")]
    DispatchNotFound(Uuid),
    #[error("payout {0} not found")]
    PayoutNotFound(Uuid),
    #[error("order code {code} already exists for pharmacy {pharmacy_id}")]
    DuplicateOrderCode { pharmacy_id: Uuid, code: String },
}

impl From<StoreError> for crate::errors::ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OrderNotFound(_)
            | StoreError::DispatchNotFound(_)
            | StoreError::PayoutNotFound(_) => crate::errors::ServiceError::NotFound(err.to_string()),
            StoreError::DuplicateOrderCode { .. } => {
                crate::errors::ServiceError::ValidationError(err.to_string())
            }
        }
    }
}

/// Concurrent entity store plus the per-order lock registry that gives every
/// order single-writer semantics.
#[derive(Debug, Default)]
pub struct StateStore {
    orders: DashMap<Uuid, Order>,
    dispatches: DashMap<Uuid, Dispatch>,
    payouts: DashMap<Uuid, PayoutRecord>,
    /// (pharmacy, order_code) uniqueness index.
    order_codes: DashMap<(Uuid, String), Uuid>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the single-writer lock for an order. The guard is owned so it
    /// can be held across awaits — but callers must NOT hold it across
    /// external provider calls (release, call, re-acquire, re-validate).
    pub async fn lock_order(&self, order_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn get_order(&self, order_id: Uuid) -> Result<Order, StoreError> {
        self.orders
            .get(&order_id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::OrderNotFound(order_id))
    }

    /// Inserts a new order, enforcing per-pharmacy order-code uniqueness.
    pub fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        let code_key = (order.pharmacy_id, order.order_code.clone());
        if self.order_codes.contains_key(&code_key) {
            return Err(StoreError::DuplicateOrderCode {
                pharmacy_id: order.pharmacy_id,
                code: order.order_code,
            });
        }
        self.order_codes.insert(code_key, order.order_id);
        self.orders.insert(order.order_id, order);
        Ok(())
    }

    /// Commits a mutated order as one whole-record write.
    pub fn commit_order(&self, order: Order) -> Result<(), StoreError> {
        if !self.orders.contains_key(&order.order_id) {
            return Err(StoreError::OrderNotFound(order.order_id));
        }
        self.orders.insert(order.order_id, order);
        Ok(())
    }

    pub fn get_dispatch(&self, dispatch_id: Uuid) -> Result<Dispatch, StoreError> {
        self.dispatches
            .get(&dispatch_id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::DispatchNotFound(dispatch_id))
    }

    pub fn insert_dispatch(&self, dispatch: Dispatch) {
        self.dispatches.insert(dispatch.dispatch_id, dispatch);
    }

    pub fn commit_dispatch(&self, dispatch: Dispatch) -> Result<(), StoreError> {
        if !self.dispatches.contains_key(&dispatch.dispatch_id) {
            return Err(StoreError::DispatchNotFound(dispatch.dispatch_id));
        }
        self.dispatches.insert(dispatch.dispatch_id, dispatch);
        Ok(())
    }

    pub fn get_payout(&self, payout_id: Uuid) -> Result<PayoutRecord, StoreError> {
        self.payouts
            .get(&payout_id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::PayoutNotFound(payout_id))
    }

    pub fn insert_payout(&self, payout: PayoutRecord) {
        self.payouts.insert(payout.payout_id, payout);
    }

    pub fn commit_payout(&self, payout: PayoutRecord) -> Result<(), StoreError> {
        if !self.payouts.contains_key(&payout.payout_id) {
            return Err(StoreError::PayoutNotFound(payout.payout_id));
        }
        self.payouts.insert(payout.payout_id, payout);
        Ok(())
    }

    /// Consistent-enough read snapshot for aggregation. Settlement math never
    /// locks orders; it works over this clone.
    pub fn orders_snapshot(&self) -> Vec<Order> {
        self.orders.iter().map(|r| r.value().clone()).collect()
    }

    pub fn payouts_snapshot(&self) -> Vec<PayoutRecord> {
        self.payouts.iter().map(|r| r.value().clone()).collect()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LineItem, OrderStatus};
    use chrono::Utc;

    fn order(pharmacy_id: Uuid, code: &str) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            order_code: code.to_string(),
            pharmacy_id,
            origin_context: "chat".into(),
            status: OrderStatus::Pending,
            items: vec![LineItem {
                drug_name: "Cetirizine".into(),
                quantity: 1,
                dosage_instructions: String::new(),
                unit_price_minor: 100,
            }],
            delivery_fee_minor: 0,
            service_fee_minor: 0,
            cancelled_reason: None,
            payment_reference: None,
            dispatch_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            paid_at: None,
            delivered_at: None,
            history: Vec::new(),
        }
    }

    #[test]
    fn order_codes_are_unique_per_pharmacy() {
        let store = StateStore::new();
        let pharmacy = Uuid::new_v4();
        store.insert_order(order(pharmacy, "RX-1")).unwrap();
        let dup = store.insert_order(order(pharmacy, "RX-1"));
        assert!(matches!(dup, Err(StoreError::DuplicateOrderCode { .. })));
        // same code under a different pharmacy is fine
        store.insert_order(order(Uuid::new_v4(), "RX-1")).unwrap();
    }

    #[test]
    fn commit_rejects_unknown_order() {
        let store = StateStore::new();
        let o = order(Uuid::new_v4(), "RX-2");
        assert!(matches!(
            store.commit_order(o),
            Err(StoreError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn per_order_lock_serializes_writers() {
        let store = Arc::new(StateStore::new());
        let id = Uuid::new_v4();
        let guard = store.lock_order(id).await;
        let store2 = store.clone();
        let contender = tokio::spawn(async move { store2.lock_order(id).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
