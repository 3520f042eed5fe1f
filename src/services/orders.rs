use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::ServiceError,
    events::{Event, EventSender},
    idempotency::IdempotencyGuard,
    models::{Actor, LineItem, Order, OrderStatus, TransitionRecord},
    store::StateStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LineItemRequest {
    #[validate(length(min = 1, message = "drug name is required"))]
    pub drug_name: String,
    #[validate(range(min = 1, message = "quantity must be positive"))]
    pub quantity: u32,
    #[serde(default)]
    pub dosage_instructions: String,
    #[validate(range(min = 0, message = "unit price cannot be negative"))]
    pub unit_price_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub pharmacy_id: Uuid,
    #[validate(length(min = 1, message = "order code is required"))]
    pub order_code: String,
    /// Chat/origination context the order was raised from.
    #[validate(length(min = 1, message = "origin context is required"))]
    pub origin_context: String,
    #[validate(length(min = 1, message = "an order needs at least one item"))]
    pub items: Vec<LineItemRequest>,
    #[serde(default)]
    pub delivery_fee_minor: i64,
    #[serde(default)]
    pub service_fee_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub order_code: String,
    pub pharmacy_id: Uuid,
    pub status: OrderStatus,
    pub items: Vec<LineItem>,
    pub medication_total_minor: i64,
    pub delivery_fee_minor: i64,
    pub service_fee_minor: i64,
    pub grand_total_minor: i64,
    pub dispatch_id: Option<Uuid>,
    pub cancelled_reason: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            order_code: order.order_code.clone(),
            pharmacy_id: order.pharmacy_id,
            status: order.status,
            items: order.items.clone(),
            medication_total_minor: order.medication_total_minor(),
            delivery_fee_minor: order.delivery_fee_minor,
            service_fee_minor: order.service_fee_minor,
            grand_total_minor: order.grand_total_minor(),
            dispatch_id: order.dispatch_id,
            cancelled_reason: order.cancelled_reason.clone(),
            payment_reference: order.payment_reference.clone(),
            created_at: order.created_at,
            updated_at: order.updated_at,
            paid_at: order.paid_at,
            delivered_at: order.delivered_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderListFilter {
    pub pharmacy_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

/// Owns the commercial lifecycle of orders. Every mutation runs under the
/// per-order lock, commits as a single whole-record write, and emits an
/// ordered domain event.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<StateStore>,
    event_sender: EventSender,
    idempotency: Arc<IdempotencyGuard>,
}

impl OrderService {
    pub fn new(
        store: Arc<StateStore>,
        event_sender: EventSender,
        idempotency: Arc<IdempotencyGuard>,
    ) -> Self {
        Self {
            store,
            event_sender,
            idempotency,
        }
    }

    /// Rejects callers that do not own the order. Admins and internal actors
    /// bypass the check.
    fn ensure_participant(order: &Order, actor: &Actor, claimed_pharmacy: Option<Uuid>) -> Result<(), ServiceError> {
        match actor {
            Actor::PharmacyStaff { .. } => match claimed_pharmacy {
                Some(pharmacy_id) if pharmacy_id == order.pharmacy_id => Ok(()),
                _ => Err(ServiceError::NotParticipant(format!(
                    "order {} belongs to another pharmacy",
                    order.order_code
                ))),
            },
            _ => Ok(()),
        }
    }

    #[instrument(skip(self, request), fields(pharmacy_id = %request.pharmacy_id, order_code = %request.order_code))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
        idempotency_key: &str,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate()?;
        }

        let cache_key = format!("create_order:{idempotency_key}");
        if let Some(stored) = self.idempotency.lookup::<OrderResponse>(&cache_key)? {
            info!(order_id = %stored.order_id, "replayed create_order from idempotency store");
            return Ok(stored);
        }

        let now = Utc::now();
        let order = Order {
            order_id: Uuid::new_v4(),
            order_code: request.order_code,
            pharmacy_id: request.pharmacy_id,
            origin_context: request.origin_context,
            status: OrderStatus::Pending,
            items: request
                .items
                .into_iter()
                .map(|item| LineItem {
                    drug_name: item.drug_name,
                    quantity: item.quantity,
                    dosage_instructions: item.dosage_instructions,
                    unit_price_minor: item.unit_price_minor,
                })
                .collect(),
            delivery_fee_minor: request.delivery_fee_minor,
            service_fee_minor: request.service_fee_minor,
            cancelled_reason: None,
            payment_reference: None,
            dispatch_id: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
            delivered_at: None,
            history: Vec::new(),
        };

        self.store.insert_order(order.clone())?;

        if let Err(e) = self
            .event_sender
            .send(Event::OrderCreated {
                order_id: order.order_id,
                pharmacy_id: order.pharmacy_id,
            })
            .await
        {
            warn!(error = %e, order_id = %order.order_id, "failed to emit order created event");
        }

        let response = OrderResponse::from(&order);
        self.idempotency.store(&cache_key, &response)?;
        info!(order_id = %order.order_id, "order created");
        Ok(response)
    }

    /// Applies one validated transition to an order. The caller MUST hold the
    /// per-order lock; this method does not take it. Commit is a single
    /// whole-record write, and the matching domain event is emitted after the
    /// commit succeeds.
    pub(crate) async fn transition_locked(
        &self,
        order_id: Uuid,
        to: OrderStatus,
        actor: Actor,
        mutate: impl FnOnce(&mut Order),
    ) -> Result<Order, ServiceError> {
        let mut order = self.store.get_order(order_id)?;
        if !order.status.can_transition_to(to) {
            return Err(ServiceError::invalid_order_transition(order_id, order.status, to));
        }

        let record = order.record_transition(to, actor.clone());
        mutate(&mut order);
        self.store
            .commit_order(order.clone())
            .map_err(|e| ServiceError::PersistenceError(e.to_string()))?;

        self.emit_transition(&order, &record).await;
        Ok(order)
    }

    async fn emit_transition(&self, order: &Order, record: &TransitionRecord) {
        if let Err(e) = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id: order.order_id,
                from: record.from,
                to: record.to,
                at: record.at,
                actor: record.actor.clone(),
            })
            .await
        {
            warn!(error = %e, order_id = %order.order_id, "failed to emit order transition event");
        }

        if record.to == OrderStatus::Delivered {
            if let Err(e) = self
                .event_sender
                .send(Event::OrderDelivered {
                    order_id: order.order_id,
                    pharmacy_id: order.pharmacy_id,
                    medication_total_minor: order.medication_total_minor(),
                })
                .await
            {
                warn!(error = %e, order_id = %order.order_id, "failed to emit order delivered event");
            }
        }
    }

    /// Staff confirms the order is fulfillable.
    #[instrument(skip(self, actor))]
    pub async fn confirm(
        &self,
        order_id: Uuid,
        actor: Actor,
        claimed_pharmacy: Option<Uuid>,
    ) -> Result<OrderResponse, ServiceError> {
        let _guard = self.store.lock_order(order_id).await;
        let order = self.store.get_order(order_id)?;
        Self::ensure_participant(&order, &actor, claimed_pharmacy)?;
        let order = self
            .transition_locked(order_id, OrderStatus::Confirmed, actor, |_| {})
            .await?;
        Ok(OrderResponse::from(&order))
    }

    /// Staff marks the medication dispensed and packaged. Every line item
    /// must be priced by now.
    #[instrument(skip(self, actor))]
    pub async fn mark_prepared(
        &self,
        order_id: Uuid,
        actor: Actor,
        claimed_pharmacy: Option<Uuid>,
    ) -> Result<OrderResponse, ServiceError> {
        let _guard = self.store.lock_order(order_id).await;
        let order = self.store.get_order(order_id)?;
        Self::ensure_participant(&order, &actor, claimed_pharmacy)?;
        if order.items.iter().any(|item| item.unit_price_minor <= 0) {
            return Err(ServiceError::ValidationError(
                "all line items must be priced before preparation".to_string(),
            ));
        }
        let order = self
            .transition_locked(order_id, OrderStatus::Prepared, actor, |_| {})
            .await?;
        Ok(OrderResponse::from(&order))
    }

    /// Payment-gateway callback. Idempotent: a duplicate callback for an
    /// order already at or past PAID is a no-op, never an error.
    #[instrument(skip(self))]
    pub async fn record_payment(
        &self,
        order_id: Uuid,
        payment_reference: &str,
    ) -> Result<OrderResponse, ServiceError> {
        let _guard = self.store.lock_order(order_id).await;
        let order = self.store.get_order(order_id)?;

        if order.status.is_paid_or_later() {
            info!(order_id = %order_id, "duplicate payment callback absorbed");
            return Ok(OrderResponse::from(&order));
        }

        let reference = payment_reference.to_string();
        let order = self
            .transition_locked(order_id, OrderStatus::Paid, Actor::PaymentGateway, |o| {
                o.payment_reference = Some(reference);
            })
            .await?;

        if let Err(e) = self
            .event_sender
            .send(Event::PaymentRecorded {
                order_id,
                payment_reference: payment_reference.to_string(),
            })
            .await
        {
            warn!(error = %e, order_id = %order_id, "failed to emit payment event");
        }
        Ok(OrderResponse::from(&order))
    }

    /// Staff- or admin-initiated cancellation, only legal before dispatch.
    #[instrument(skip(self, actor))]
    pub async fn cancel(
        &self,
        order_id: Uuid,
        reason: &str,
        actor: Actor,
        claimed_pharmacy: Option<Uuid>,
    ) -> Result<OrderResponse, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "cancellation requires a reason".to_string(),
            ));
        }

        let _guard = self.store.lock_order(order_id).await;
        let order = self.store.get_order(order_id)?;
        Self::ensure_participant(&order, &actor, claimed_pharmacy)?;

        if matches!(order.status, OrderStatus::Dispatched | OrderStatus::InTransit) {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is already with a courier; cancel the dispatch instead",
                order.order_code
            )));
        }

        let reason = reason.trim().to_string();
        let order = self
            .transition_locked(order_id, OrderStatus::Cancelled, actor, |o| {
                o.cancelled_reason = Some(reason);
            })
            .await?;
        Ok(OrderResponse::from(&order))
    }

    pub fn get_order(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        Ok(OrderResponse::from(&self.store.get_order(order_id)?))
    }

    pub fn get_history(&self, order_id: Uuid) -> Result<Vec<TransitionRecord>, ServiceError> {
        Ok(self.store.get_order(order_id)?.history)
    }

    /// Order browsing for the consoles: filtered, newest first, paginated.
    pub fn list_orders(&self, filter: &OrderListFilter) -> (Vec<OrderResponse>, u64) {
        let mut orders: Vec<Order> = self
            .store
            .orders_snapshot()
            .into_iter()
            .filter(|o| filter.pharmacy_id.map_or(true, |p| o.pharmacy_id == p))
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = orders.len() as u64;
        let page = filter.page.unwrap_or(1).max(1);
        let limit = filter.limit.unwrap_or(20).clamp(1, 100);
        let start = ((page - 1) * limit) as usize;
        let items = orders
            .iter()
            .skip(start)
            .take(limit as usize)
            .map(OrderResponse::from)
            .collect();
        (items, total)
    }
}
