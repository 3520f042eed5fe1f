use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Half-open aggregation window: `start` inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SettlementWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Aggregated money figures for one window. All values are minor currency
/// units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTotals {
    /// Sum of medication totals over delivered orders in the window.
    pub gross_volume_minor: i64,
    /// `gross × fee_bps / 10_000`.
    pub platform_fee_minor: i64,
    pub net_payable_minor: i64,
    pub delivery_fees_minor: i64,
    /// Paid but not yet delivered: earned nothing yet.
    pub pending_payments_minor: i64,
    pub paid_orders: u64,
    pub unpaid_orders: u64,
}

/// Derived view over an order snapshot. Never authoritative: always
/// recomputable from the order set, and cached only for read amortization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSnapshot {
    pub window: SettlementWindow,
    pub totals: SettlementTotals,
    pub per_pharmacy: BTreeMap<Uuid, SettlementTotals>,
    pub computed_at: DateTime<Utc>,
}
