use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PayoutStatus {
    Pending,
    Initiated,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutStatus::Completed | PayoutStatus::Failed)
    }

    /// Non-failed payouts hold a claim against the pharmacy's payable balance.
    pub fn reserves_balance(&self) -> bool {
        !matches!(self, PayoutStatus::Failed)
    }

    pub fn can_transition_to(self, next: PayoutStatus) -> bool {
        use PayoutStatus::*;
        matches!(
            (self, next),
            (Pending, Initiated) | (Initiated, Completed) | (Pending | Initiated, Failed)
        )
    }
}

/// A manually-triggered, audit-logged record of payout intent and outcome.
/// Money moves on an external bank rail; this record only constrains how much
/// may ever be drawn against a pharmacy's net payable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub payout_id: Uuid,
    pub pharmacy_id: Uuid,
    pub amount_minor: i64,
    pub status: PayoutStatus,
    pub initiated_by: super::Actor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payout_lifecycle_table() {
        use PayoutStatus::*;
        assert!(Pending.can_transition_to(Initiated));
        assert!(Initiated.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Initiated.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Initiated));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn failed_payouts_release_their_claim() {
        assert!(PayoutStatus::Pending.reserves_balance());
        assert!(PayoutStatus::Initiated.reserves_balance());
        assert!(PayoutStatus::Completed.reserves_balance());
        assert!(!PayoutStatus::Failed.reserves_balance());
    }
}
