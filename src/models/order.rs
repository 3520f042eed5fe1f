use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Canonical commercial states of an order.
///
/// This is the single enumeration for order status in the system; the wire
/// boundary parses case-insensitively (`in_transit` and `IN_TRANSIT` are the
/// same state) and always renders the canonical SCREAMING_SNAKE_CASE form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Prepared,
    Paid,
    Dispatched,
    InTransit,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// True once payment has been recorded (used for settlement counts and
    /// payment-callback replay detection).
    pub fn is_paid_or_later(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid
                | OrderStatus::Dispatched
                | OrderStatus::InTransit
                | OrderStatus::Delivered
        )
    }

    /// Whether staff-initiated cancellation is still available. Once dispatch
    /// has been booked, physical fulfillment is in flight and cancellation
    /// must go through the dispatch machine instead.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Prepared | OrderStatus::Paid
        )
    }

    /// The transition table for the commercial lifecycle.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Confirmed) => true,
            (Confirmed, Prepared) => true,
            (Prepared, Paid) => true,
            (Paid, Dispatched) => true,
            (Dispatched, InTransit) => true,
            (InTransit, Delivered) => true,

            // Staff cancellation is only legal before dispatch.
            (Pending | Confirmed | Prepared | Paid, Cancelled) => true,

            // Provider-reported non-recoverable failure.
            (Dispatched | InTransit, Failed) => true,

            // Dispatch cancelled before pickup returns the order to PAID so a
            // fresh booking can be attached; a failed order is re-bookable the
            // same way once its dispatch is terminal.
            (Dispatched | InTransit, Paid) => true,
            (Failed, Dispatched) => true,

            _ => false,
        }
    }
}

/// Who caused a transition. Recorded in the order history and in every
/// emitted domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    PharmacyStaff { staff_id: Uuid },
    Admin { admin_id: Uuid },
    PaymentGateway,
    DispatchProvider,
    System,
}

/// One medication line on an order. Prices are minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub drug_name: String,
    pub quantity: u32,
    pub dosage_instructions: String,
    pub unit_price_minor: i64,
}

impl LineItem {
    pub fn total_minor(&self) -> i64 {
        self.unit_price_minor * i64::from(self.quantity)
    }
}

/// One entry in the per-order transition history. The history is the durable,
/// ordered record of everything that happened to the order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub at: DateTime<Utc>,
    pub actor: Actor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    /// Human-facing code, unique within the issuing pharmacy.
    pub order_code: String,
    pub pharmacy_id: Uuid,
    /// Opaque reference to the chat/origination context the order was raised
    /// from. The conversational surface itself lives outside this service.
    pub origin_context: String,
    pub status: OrderStatus,
    pub items: Vec<LineItem>,
    pub delivery_fee_minor: i64,
    pub service_fee_minor: i64,
    pub cancelled_reason: Option<String>,
    pub payment_reference: Option<String>,
    pub dispatch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub history: Vec<TransitionRecord>,
}

impl Order {
    /// Sum of line item totals.
    pub fn medication_total_minor(&self) -> i64 {
        self.items.iter().map(LineItem::total_minor).sum()
    }

    pub fn grand_total_minor(&self) -> i64 {
        self.medication_total_minor() + self.delivery_fee_minor + self.service_fee_minor
    }

    /// Applies an already-validated transition: updates the status, stamps
    /// lifecycle timestamps, and appends to the history. Callers are expected
    /// to have checked `can_transition_to` first; this method is the single
    /// mutation point so the record is always internally consistent.
    pub fn record_transition(&mut self, to: OrderStatus, actor: Actor) -> TransitionRecord {
        let now = Utc::now();
        let record = TransitionRecord {
            from: self.status,
            to,
            at: now,
            actor,
        };
        self.status = to;
        self.updated_at = now;
        match to {
            OrderStatus::Paid => {
                if self.paid_at.is_none() {
                    self.paid_at = Some(now);
                }
            }
            OrderStatus::Delivered => self.delivered_at = Some(now),
            _ => {}
        }
        self.history.push(record.clone());
        record
    }
}
