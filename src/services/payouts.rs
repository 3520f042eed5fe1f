use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::ServiceError,
    events::{Event, EventSender},
    models::{Actor, PayoutRecord, PayoutStatus},
    services::settlement::SettlementCalculator,
    store::StateStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InitiatePayoutRequest {
    pub pharmacy_id: Uuid,
    #[validate(range(min = 1, message = "payout amount must be positive"))]
    pub amount_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutResponse {
    pub payout_id: Uuid,
    pub pharmacy_id: Uuid,
    pub amount_minor: i64,
    pub status: PayoutStatus,
    pub failure_reason: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<&PayoutRecord> for PayoutResponse {
    fn from(record: &PayoutRecord) -> Self {
        Self {
            payout_id: record.payout_id,
            pharmacy_id: record.pharmacy_id,
            amount_minor: record.amount_minor,
            status: record.status,
            failure_reason: record.failure_reason.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Records payout intent and outcome against a pharmacy's earned balance.
/// Money moves on an external bank rail; this service only guarantees that
/// completed payouts can never exceed all-time net payable.
#[derive(Clone)]
pub struct PayoutService {
    store: Arc<StateStore>,
    event_sender: EventSender,
    fee_bps: u32,
    /// Serializes initiations so two concurrent payouts cannot both pass the
    /// balance check.
    init_lock: Arc<tokio::sync::Mutex<()>>,
}

impl PayoutService {
    pub fn new(store: Arc<StateStore>, event_sender: EventSender, fee_bps: u32) -> Self {
        Self {
            store,
            event_sender,
            fee_bps,
            init_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Net payable still undrawn: all-time earnings minus every payout that
    /// holds a claim (pending, initiated or completed).
    pub fn available_balance(&self, pharmacy_id: Uuid) -> i64 {
        let orders = self.store.orders_snapshot();
        let earned = SettlementCalculator::all_time_net_payable(&orders, pharmacy_id, self.fee_bps);
        let reserved: i64 = self
            .store
            .payouts_snapshot()
            .iter()
            .filter(|p| p.pharmacy_id == pharmacy_id && p.status.reserves_balance())
            .map(|p| p.amount_minor)
            .sum();
        earned - reserved
    }

    #[instrument(skip(self, actor), fields(pharmacy_id = %request.pharmacy_id, amount = request.amount_minor))]
    pub async fn initiate(
        &self,
        request: InitiatePayoutRequest,
        actor: Actor,
    ) -> Result<PayoutResponse, ServiceError> {
        request.validate()?;

        if !matches!(actor, Actor::Admin { .. }) {
            return Err(ServiceError::NotParticipant(
                "only admins may initiate payouts".to_string(),
            ));
        }

        let _guard = self.init_lock.lock().await;

        let available = self.available_balance(request.pharmacy_id);
        if request.amount_minor > available {
            return Err(ServiceError::InvalidOperation(format!(
                "payout of {} exceeds available balance {}",
                request.amount_minor, available
            )));
        }

        let now = Utc::now();
        let record = PayoutRecord {
            payout_id: Uuid::new_v4(),
            pharmacy_id: request.pharmacy_id,
            amount_minor: request.amount_minor,
            status: PayoutStatus::Pending,
            initiated_by: actor,
            created_at: now,
            updated_at: now,
            failure_reason: None,
        };
        self.store.insert_payout(record.clone());

        if let Err(e) = self
            .event_sender
            .send(Event::PayoutInitiated {
                payout_id: record.payout_id,
                pharmacy_id: record.pharmacy_id,
                amount_minor: record.amount_minor,
            })
            .await
        {
            tracing::warn!(error = %e, payout_id = %record.payout_id, "failed to emit payout event");
        }

        info!(payout_id = %record.payout_id, "payout initiated");
        Ok(PayoutResponse::from(&record))
    }

    async fn transition(
        &self,
        payout_id: Uuid,
        to: PayoutStatus,
        failure_reason: Option<String>,
    ) -> Result<PayoutResponse, ServiceError> {
        let mut record = self.store.get_payout(payout_id)?;
        if !record.status.can_transition_to(to) {
            return Err(ServiceError::InvalidTransition {
                entity: "payout",
                id: payout_id,
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }
        record.status = to;
        record.failure_reason = failure_reason;
        record.updated_at = Utc::now();
        self.store
            .commit_payout(record.clone())
            .map_err(|e| ServiceError::PersistenceError(e.to_string()))?;

        if to.is_terminal() {
            if let Err(e) = self
                .event_sender
                .send(Event::PayoutResolved {
                    payout_id,
                    pharmacy_id: record.pharmacy_id,
                    completed: to == PayoutStatus::Completed,
                })
                .await
            {
                tracing::warn!(error = %e, payout_id = %payout_id, "failed to emit payout event");
            }
        }
        Ok(PayoutResponse::from(&record))
    }

    /// The bank rail accepted the transfer.
    pub async fn mark_initiated(&self, payout_id: Uuid) -> Result<PayoutResponse, ServiceError> {
        self.transition(payout_id, PayoutStatus::Initiated, None).await
    }

    pub async fn mark_completed(&self, payout_id: Uuid) -> Result<PayoutResponse, ServiceError> {
        self.transition(payout_id, PayoutStatus::Completed, None).await
    }

    pub async fn mark_failed(
        &self,
        payout_id: Uuid,
        reason: &str,
    ) -> Result<PayoutResponse, ServiceError> {
        self.transition(payout_id, PayoutStatus::Failed, Some(reason.to_string()))
            .await
    }

    pub fn list_payouts(&self, pharmacy_id: Option<Uuid>) -> Vec<PayoutResponse> {
        let mut payouts: Vec<PayoutRecord> = self
            .store
            .payouts_snapshot()
            .into_iter()
            .filter(|p| pharmacy_id.map_or(true, |id| p.pharmacy_id == id))
            .collect();
        payouts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        payouts.iter().map(PayoutResponse::from).collect()
    }
}
