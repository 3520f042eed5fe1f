use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    cache::AggregateCache,
    errors::ServiceError,
    models::{Order, OrderStatus, SettlementSnapshot, SettlementTotals, SettlementWindow},
    store::StateStore,
};

/// Basis-point denominator: 500 bps = 5%.
const BPS_DENOMINATOR: i64 = 10_000;

/// Pure settlement math over an immutable order snapshot. Deterministic and
/// order-independent: permuting the input yields identical figures.
pub struct SettlementCalculator;

impl SettlementCalculator {
    pub fn platform_fee(gross_volume_minor: i64, fee_bps: u32) -> i64 {
        gross_volume_minor * i64::from(fee_bps) / BPS_DENOMINATOR
    }

    fn accumulate(totals: &mut SettlementTotals, order: &Order, window: &SettlementWindow) {
        match order.status {
            OrderStatus::Delivered => {
                if order.delivered_at.is_some_and(|at| window.contains(at)) {
                    totals.gross_volume_minor += order.medication_total_minor();
                    totals.delivery_fees_minor += order.delivery_fee_minor;
                    totals.paid_orders += 1;
                }
            }
            // Paid but not yet delivered: money received, nothing earned.
            OrderStatus::Paid | OrderStatus::Dispatched | OrderStatus::InTransit => {
                if order.paid_at.is_some_and(|at| window.contains(at)) {
                    totals.pending_payments_minor += order.grand_total_minor();
                    totals.paid_orders += 1;
                }
            }
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Prepared => {
                if window.contains(order.created_at) {
                    totals.unpaid_orders += 1;
                }
            }
            OrderStatus::Cancelled | OrderStatus::Failed => {}
        }
    }

    fn finalize(totals: &mut SettlementTotals, fee_bps: u32) {
        totals.platform_fee_minor = Self::platform_fee(totals.gross_volume_minor, fee_bps);
        totals.net_payable_minor = totals.gross_volume_minor - totals.platform_fee_minor;
    }

    /// Computes the full snapshot: overall totals plus the per-pharmacy
    /// breakdown. Both run over the same pass, so the partition invariant
    /// (Σ per-pharmacy == overall) holds by construction.
    pub fn compute(orders: &[Order], window: SettlementWindow, fee_bps: u32) -> SettlementSnapshot {
        let mut totals = SettlementTotals::default();
        let mut per_pharmacy: BTreeMap<Uuid, SettlementTotals> = BTreeMap::new();

        for order in orders {
            Self::accumulate(&mut totals, order, &window);
            Self::accumulate(
                per_pharmacy.entry(order.pharmacy_id).or_default(),
                order,
                &window,
            );
        }

        Self::finalize(&mut totals, fee_bps);
        for pharmacy_totals in per_pharmacy.values_mut() {
            Self::finalize(pharmacy_totals, fee_bps);
        }

        SettlementSnapshot {
            window,
            totals,
            per_pharmacy,
            computed_at: Utc::now(),
        }
    }

    /// All-time net payable for one pharmacy over its delivered orders. The
    /// payout invariant is checked against this figure.
    pub fn all_time_net_payable(orders: &[Order], pharmacy_id: Uuid, fee_bps: u32) -> i64 {
        let gross: i64 = orders
            .iter()
            .filter(|o| o.pharmacy_id == pharmacy_id && o.status == OrderStatus::Delivered)
            .map(Order::medication_total_minor)
            .sum();
        gross - Self::platform_fee(gross, fee_bps)
    }
}

/// Cached order/dispatch counts for the dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardCounts {
    pub orders_by_status: BTreeMap<String, u64>,
    pub total_orders: u64,
}

/// Read-side service over the calculator: lazily recomputes aggregate views
/// and caches them until the reconciliation bridge invalidates or the TTL
/// backstop expires.
#[derive(Clone)]
pub struct SettlementService {
    store: Arc<StateStore>,
    cache: Arc<AggregateCache>,
    fee_bps: u32,
}

pub const SETTLEMENT_CACHE_PREFIX: &str = "settlement:";
pub const DASHBOARD_CACHE_PREFIX: &str = "dashboard:";

impl SettlementService {
    pub fn new(store: Arc<StateStore>, cache: Arc<AggregateCache>, fee_bps: u32) -> Self {
        Self {
            store,
            cache,
            fee_bps,
        }
    }

    pub fn fee_bps(&self) -> u32 {
        self.fee_bps
    }

    fn window_key(window: &SettlementWindow) -> String {
        format!(
            "{SETTLEMENT_CACHE_PREFIX}{}:{}",
            window.start.timestamp(),
            window.end.timestamp()
        )
    }

    /// Settlement summary for a window, optionally narrowed to one pharmacy.
    /// The full snapshot is cached per window; the per-pharmacy slice is cut
    /// from it on the way out.
    #[instrument(skip(self))]
    pub fn summary(
        &self,
        window: SettlementWindow,
        pharmacy_id: Option<Uuid>,
    ) -> Result<SettlementSnapshot, ServiceError> {
        if window.end <= window.start {
            return Err(ServiceError::ValidationError(
                "settlement window end must be after start".to_string(),
            ));
        }

        let key = Self::window_key(&window);
        let snapshot = match self.cache.get::<SettlementSnapshot>(&key) {
            Some(cached) => cached,
            None => {
                debug!("settlement cache miss; recomputing");
                let orders = self.store.orders_snapshot();
                let snapshot = SettlementCalculator::compute(&orders, window, self.fee_bps);
                if let Err(e) = self.cache.set(&key, &snapshot) {
                    debug!(error = %e, "failed to cache settlement snapshot");
                }
                snapshot
            }
        };

        match pharmacy_id {
            None => Ok(snapshot),
            Some(pharmacy) => {
                let totals = snapshot
                    .per_pharmacy
                    .get(&pharmacy)
                    .cloned()
                    .unwrap_or_default();
                let mut per_pharmacy = BTreeMap::new();
                per_pharmacy.insert(pharmacy, totals.clone());
                Ok(SettlementSnapshot {
                    window: snapshot.window,
                    totals,
                    per_pharmacy,
                    computed_at: snapshot.computed_at,
                })
            }
        }
    }

    /// Order counts by status for the dashboards, optionally per pharmacy.
    pub fn dashboard_counts(&self, pharmacy_id: Option<Uuid>) -> DashboardCounts {
        let key = format!(
            "{DASHBOARD_CACHE_PREFIX}{}",
            pharmacy_id.map_or_else(|| "all".to_string(), |p| p.to_string())
        );
        if let Some(cached) = self.cache.get::<DashboardCounts>(&key) {
            return cached;
        }

        let mut counts = DashboardCounts::default();
        for order in self.store.orders_snapshot() {
            if pharmacy_id.is_some_and(|p| p != order.pharmacy_id) {
                continue;
            }
            counts.total_orders += 1;
            *counts
                .orders_by_status
                .entry(order.status.to_string())
                .or_default() += 1;
        }
        if let Err(e) = self.cache.set(&key, &counts) {
            debug!(error = %e, "failed to cache dashboard counts");
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineItem;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn delivered_order(pharmacy_id: Uuid, medication_minor: i64) -> Order {
        let delivered_at = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        Order {
            order_id: Uuid::new_v4(),
            order_code: format!("RX-{}", Uuid::new_v4().simple()),
            pharmacy_id,
            origin_context: "chat".into(),
            status: OrderStatus::Delivered,
            items: vec![LineItem {
                drug_name: "Drug".into(),
                quantity: 1,
                dosage_instructions: String::new(),
                unit_price_minor: medication_minor,
            }],
            delivery_fee_minor: 500,
            service_fee_minor: 100,
            cancelled_reason: None,
            payment_reference: Some("pay-ref".into()),
            dispatch_id: None,
            created_at: delivered_at - ChronoDuration::hours(4),
            updated_at: delivered_at,
            paid_at: Some(delivered_at - ChronoDuration::hours(2)),
            delivered_at: Some(delivered_at),
            history: Vec::new(),
        }
    }

    fn june_window() -> SettlementWindow {
        SettlementWindow {
            start: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn five_percent_fee_on_delivered_volume() {
        // ₦2,000 × 1 + ₦500 × 3 in minor units (kobo)
        let pharmacy = Uuid::new_v4();
        let mut order = delivered_order(pharmacy, 0);
        order.items = vec![
            LineItem {
                drug_name: "A".into(),
                quantity: 1,
                dosage_instructions: String::new(),
                unit_price_minor: 200_000,
            },
            LineItem {
                drug_name: "B".into(),
                quantity: 3,
                dosage_instructions: String::new(),
                unit_price_minor: 50_000,
            },
        ];
        let snapshot = SettlementCalculator::compute(&[order], june_window(), 500);
        assert_eq!(snapshot.totals.gross_volume_minor, 350_000);
        assert_eq!(snapshot.totals.platform_fee_minor, 17_500);
        assert_eq!(snapshot.totals.net_payable_minor, 332_500);
        assert_eq!(snapshot.totals.delivery_fees_minor, 500);
        assert_eq!(snapshot.totals.paid_orders, 1);
    }

    #[test]
    fn window_end_is_exclusive() {
        let pharmacy = Uuid::new_v4();
        let mut order = delivered_order(pharmacy, 1000);
        order.delivered_at = Some(june_window().end);
        let snapshot = SettlementCalculator::compute(&[order], june_window(), 500);
        assert_eq!(snapshot.totals.gross_volume_minor, 0);
    }

    #[test]
    fn pending_payments_cover_paid_undelivered_orders() {
        let pharmacy = Uuid::new_v4();
        let mut order = delivered_order(pharmacy, 10_000);
        order.status = OrderStatus::InTransit;
        order.delivered_at = None;
        let snapshot = SettlementCalculator::compute(&[order.clone()], june_window(), 500);
        assert_eq!(snapshot.totals.gross_volume_minor, 0);
        assert_eq!(
            snapshot.totals.pending_payments_minor,
            order.grand_total_minor()
        );
    }

    #[test]
    fn per_pharmacy_breakdown_reconciles() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let orders = vec![
            delivered_order(p1, 1_000),
            delivered_order(p1, 2_000),
            delivered_order(p2, 5_000),
        ];
        let snapshot = SettlementCalculator::compute(&orders, june_window(), 500);
        let gross_sum: i64 = snapshot
            .per_pharmacy
            .values()
            .map(|t| t.gross_volume_minor)
            .sum();
        assert_eq!(gross_sum, snapshot.totals.gross_volume_minor);
        assert_eq!(snapshot.per_pharmacy[&p1].gross_volume_minor, 3_000);
        assert_eq!(snapshot.per_pharmacy[&p2].gross_volume_minor, 5_000);
    }

    #[test]
    fn permutation_does_not_change_totals() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let orders = vec![
            delivered_order(p1, 1_000),
            delivered_order(p2, 2_000),
            delivered_order(p1, 3_000),
        ];
        let forward = SettlementCalculator::compute(&orders, june_window(), 500);
        let mut reversed = orders;
        reversed.reverse();
        let backward = SettlementCalculator::compute(&reversed, june_window(), 500);
        assert_eq!(forward.totals, backward.totals);
        assert_eq!(forward.per_pharmacy, backward.per_pharmacy);
    }
}
