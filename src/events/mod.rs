use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::AggregateCache;
use crate::models::{Actor, DispatchStatus, OrderStatus};

/// Domain events emitted on every committed transition. Consumed by the
/// background processing loop and fanned out to push subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        pharmacy_id: Uuid,
    },
    OrderStatusChanged {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
        actor: Actor,
    },
    DispatchCreated {
        dispatch_id: Uuid,
        order_id: Uuid,
    },
    DispatchStatusChanged {
        dispatch_id: Uuid,
        order_id: Uuid,
        from: DispatchStatus,
        to: DispatchStatus,
        at: DateTime<Utc>,
        actor: Actor,
    },
    PaymentRecorded {
        order_id: Uuid,
        payment_reference: String,
    },
    /// Terminal settlement-relevant event: the order's medication total is now
    /// part of gross volume.
    OrderDelivered {
        order_id: Uuid,
        pharmacy_id: Uuid,
        medication_total_minor: i64,
    },
    PayoutInitiated {
        payout_id: Uuid,
        pharmacy_id: Uuid,
        amount_minor: i64,
    },
    PayoutResolved {
        payout_id: Uuid,
        pharmacy_id: Uuid,
        completed: bool,
    },
}

/// Real-time push notice delivered to subscribed observers (dashboards,
/// admin consoles) on every committed transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangeNotice {
    /// "order" or "dispatch".
    pub entity: &'static str,
    pub id: Uuid,
    pub new_state: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event to the processing loop. Event delivery failure never
    /// fails the transition that produced it; the caller logs and moves on.
    pub async fn send(&self, event: Event) -> Result<(), crate::errors::ServiceError> {
        self.sender
            .send(event)
            .await
            .map_err(|e| crate::errors::ServiceError::EventError(e.to_string()))
    }
}

/// Background loop: logs every event, counts it, fans transition events out
/// to push subscribers, and stales cached aggregate views so client-initiated
/// mutations invalidate the same way bridge-applied ones do. Observers that
/// lag simply miss notices (broadcast semantics); authoritative state is
/// always re-readable.
pub async fn process_events(
    mut rx: mpsc::Receiver<Event>,
    push: broadcast::Sender<StateChangeNotice>,
    aggregate_cache: Arc<AggregateCache>,
) {
    info!("event processing loop started");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderStatusChanged {
                order_id, from, to, at, ..
            } => {
                info!(order_id = %order_id, from = %from, to = %to, "order transition");
                metrics::counter!("order_transitions_total", 1, "to" => to.to_string());
                aggregate_cache.invalidate_prefix(crate::services::settlement::SETTLEMENT_CACHE_PREFIX);
                aggregate_cache.invalidate_prefix(crate::services::settlement::DASHBOARD_CACHE_PREFIX);
                let _ = push.send(StateChangeNotice {
                    entity: "order",
                    id: *order_id,
                    new_state: to.to_string(),
                    at: *at,
                });
            }
            Event::DispatchStatusChanged {
                dispatch_id, from, to, at, ..
            } => {
                info!(dispatch_id = %dispatch_id, from = %from, to = %to, "dispatch transition");
                metrics::counter!("dispatch_transitions_total", 1, "to" => to.to_string());
                let _ = push.send(StateChangeNotice {
                    entity: "dispatch",
                    id: *dispatch_id,
                    new_state: to.to_string(),
                    at: *at,
                });
            }
            Event::OrderDelivered {
                order_id,
                pharmacy_id,
                medication_total_minor,
            } => {
                info!(
                    order_id = %order_id,
                    pharmacy_id = %pharmacy_id,
                    amount_minor = medication_total_minor,
                    "order delivered; gross volume accrued"
                );
            }
            Event::PaymentRecorded { order_id, .. } => {
                info!(order_id = %order_id, "payment recorded");
            }
            Event::OrderCreated { order_id, pharmacy_id } => {
                info!(order_id = %order_id, pharmacy_id = %pharmacy_id, "order created");
            }
            Event::DispatchCreated { dispatch_id, order_id } => {
                info!(dispatch_id = %dispatch_id, order_id = %order_id, "dispatch created");
            }
            Event::PayoutInitiated {
                payout_id,
                pharmacy_id,
                amount_minor,
            } => {
                info!(
                    payout_id = %payout_id,
                    pharmacy_id = %pharmacy_id,
                    amount_minor = amount_minor,
                    "payout initiated"
                );
            }
            Event::PayoutResolved {
                payout_id, completed, ..
            } => {
                info!(payout_id = %payout_id, completed = completed, "payout resolved");
            }
        }
    }

    warn!("event processing loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_fan_out_to_push_subscribers() {
        let (tx, rx) = mpsc::channel(16);
        let (push_tx, mut push_rx) = broadcast::channel(16);
        tokio::spawn(process_events(
            rx,
            push_tx,
            Arc::new(AggregateCache::new(None)),
        ));

        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();
        sender
            .send(Event::OrderStatusChanged {
                order_id,
                from: OrderStatus::Pending,
                to: OrderStatus::Confirmed,
                at: Utc::now(),
                actor: Actor::System,
            })
            .await
            .unwrap();

        let notice = push_rx.recv().await.unwrap();
        assert_eq!(notice.entity, "order");
        assert_eq!(notice.id, order_id);
        assert_eq!(notice.new_state, "CONFIRMED");
    }
}
