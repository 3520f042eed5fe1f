use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    cache::AggregateCache,
    errors::ServiceError,
    models::DispatchStatus,
    services::{
        dispatch::{DispatchService, ProviderApply},
        orders::OrderService,
        settlement::{DASHBOARD_CACHE_PREFIX, SETTLEMENT_CACHE_PREFIX},
    },
};

/// Closed tagged-variant form of every externally-sourced event the bridge
/// accepts. Webhook payloads are parsed into this at the boundary;
/// unrecognized shapes are rejected there and never reach the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundEvent {
    DispatchStatus {
        source_event_id: String,
        dispatch_id: Uuid,
        status: DispatchStatus,
        #[serde(default)]
        driver_phone_masked: Option<String>,
        #[serde(default)]
        tracking_url: Option<String>,
        at: DateTime<Utc>,
    },
    PaymentOutcome {
        source_event_id: String,
        order_id: Uuid,
        payment_reference: String,
        success: bool,
        at: DateTime<Utc>,
    },
}

impl InboundEvent {
    pub fn source_event_id(&self) -> &str {
        match self {
            InboundEvent::DispatchStatus { source_event_id, .. }
            | InboundEvent::PaymentOutcome { source_event_id, .. } => source_event_id,
        }
    }
}

/// What happened to an inbound event. `Duplicate` and `Stale` are success
/// outcomes from the caller's perspective — at-least-once upstreams retry
/// until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    Duplicate,
    Stale,
}

/// Single entry point for externally-sourced events: provider webhooks and
/// payment callbacks. Deduplicates by `source_event_id`, absorbs stale
/// transitions, and invalidates cached aggregates after every applied change.
#[derive(Clone)]
pub struct ReconciliationBridge {
    orders: OrderService,
    dispatches: DispatchService,
    cache: Arc<AggregateCache>,
    seen_events: Arc<DashMap<String, Instant>>,
    dedup_retention: Duration,
}

impl ReconciliationBridge {
    pub fn new(
        orders: OrderService,
        dispatches: DispatchService,
        cache: Arc<AggregateCache>,
        dedup_retention: Duration,
    ) -> Self {
        Self {
            orders,
            dispatches,
            cache,
            seen_events: Arc::new(DashMap::new()),
            dedup_retention,
        }
    }

    fn already_seen(&self, source_event_id: &str) -> bool {
        let fresh = match self.seen_events.get(source_event_id) {
            Some(seen_at) => seen_at.elapsed() < self.dedup_retention,
            None => return false,
        };
        if !fresh {
            self.seen_events.remove(source_event_id);
        }
        fresh
    }

    fn mark_seen(&self, source_event_id: &str) {
        self.seen_events
            .insert(source_event_id.to_string(), Instant::now());
    }

    fn invalidate_aggregates(&self) {
        self.cache.invalidate_prefix(SETTLEMENT_CACHE_PREFIX);
        self.cache.invalidate_prefix(DASHBOARD_CACHE_PREFIX);
    }

    /// Applies one inbound event. Events are applied in arrival order; an
    /// event whose transition is no longer legal is discarded as `Stale`
    /// (logged, counted, acknowledged), never surfaced as a failure.
    #[instrument(skip(self, event), fields(source_event_id = %event.source_event_id()))]
    pub async fn apply(&self, event: InboundEvent) -> Result<ReconcileOutcome, ServiceError> {
        let source_event_id = event.source_event_id().to_string();
        if self.already_seen(&source_event_id) {
            info!("duplicate inbound event absorbed");
            metrics::counter!("reconciliation_events_total", 1, "outcome" => "duplicate");
            return Ok(ReconcileOutcome::Duplicate);
        }

        let outcome = match event {
            InboundEvent::DispatchStatus {
                dispatch_id,
                status,
                driver_phone_masked,
                tracking_url,
                ..
            } => {
                match self
                    .dispatches
                    .apply_provider_status(dispatch_id, status, driver_phone_masked, tracking_url)
                    .await
                {
                    Ok(ProviderApply::Applied) => ReconcileOutcome::Applied,
                    Ok(ProviderApply::Stale { reason }) => {
                        info!(dispatch_id = %dispatch_id, reason = %reason, "stale provider event discarded");
                        ReconcileOutcome::Stale
                    }
                    Err(ServiceError::NotFound(detail)) => {
                        // A webhook for a dispatch this instance never created:
                        // quarantine as stale rather than failing the upstream.
                        warn!(dispatch_id = %dispatch_id, detail = %detail, "provider event for unknown dispatch");
                        ReconcileOutcome::Stale
                    }
                    Err(err) => return Err(err),
                }
            }
            InboundEvent::PaymentOutcome {
                order_id,
                payment_reference,
                success,
                ..
            } => {
                if !success {
                    info!(order_id = %order_id, "payment failure reported; order awaits retry");
                    ReconcileOutcome::Applied
                } else {
                    match self.orders.record_payment(order_id, &payment_reference).await {
                        Ok(_) => ReconcileOutcome::Applied,
                        Err(ServiceError::InvalidTransition { from, .. }) => {
                            // e.g. callback racing a cancellation
                            info!(order_id = %order_id, from = %from, "payment callback no longer applicable");
                            ReconcileOutcome::Stale
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        };

        // Only remember events that reached a final outcome; a transient
        // failure above must stay replayable under the same id.
        self.mark_seen(&source_event_id);

        match outcome {
            ReconcileOutcome::Applied => {
                metrics::counter!("reconciliation_events_total", 1, "outcome" => "applied");
                self.invalidate_aggregates();
            }
            ReconcileOutcome::Stale => {
                metrics::counter!("reconciliation_events_total", 1, "outcome" => "stale");
            }
            ReconcileOutcome::Duplicate => {}
        }

        Ok(outcome)
    }

    /// Drops expired dedup entries. Run periodically from a background task.
    pub fn sweep_expired(&self) {
        self.seen_events
            .retain(|_, seen_at| seen_at.elapsed() < self.dedup_retention);
    }
}
