use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerError},
    errors::ServiceError,
    events::{Event, EventSender},
    idempotency::IdempotencyGuard,
    models::{Actor, Destination, Dispatch, DispatchStatus, Order, OrderStatus},
    provider::{CourierProvider, ProviderError},
    rate_limiter::RateLimiter,
    services::orders::OrderService,
    store::StateStore,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub dispatch_id: Uuid,
    pub order_id: Uuid,
    pub status: DispatchStatus,
    pub provider: Option<String>,
    pub delivery_charge_minor: Option<i64>,
    pub tracking_url: Option<String>,
    pub driver_phone_masked: Option<String>,
    pub destination: Option<Destination>,
    pub otp_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Dispatch> for DispatchResponse {
    fn from(dispatch: &Dispatch) -> Self {
        Self {
            dispatch_id: dispatch.dispatch_id,
            order_id: dispatch.order_id,
            status: dispatch.status,
            provider: dispatch.provider.clone(),
            delivery_charge_minor: dispatch.delivery_charge_minor,
            tracking_url: dispatch.tracking_url.clone(),
            driver_phone_masked: dispatch.driver_phone_masked.clone(),
            destination: dispatch.destination.clone(),
            otp_verified_at: dispatch.otp_verified_at,
            created_at: dispatch.created_at,
            updated_at: dispatch.updated_at,
        }
    }
}

/// Booking result. The delivery code is returned exactly once, for relay to
/// the patient channel; it is never serialized with the dispatch record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingResult {
    pub dispatch: DispatchResponse,
    pub delivery_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOtpResponse {
    pub success: bool,
    pub dispatch: DispatchResponse,
}

/// Outcome of a provider-pushed status update applied via the
/// reconciliation bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderApply {
    Applied,
    Stale { reason: String },
}

/// Owns the courier-side lifecycle. Provider calls are never made while the
/// per-order lock is held: validate under the lock, release, call with a
/// bounded timeout behind the circuit breaker, re-acquire, re-validate,
/// apply or reject.
#[derive(Clone)]
pub struct DispatchService {
    store: Arc<StateStore>,
    event_sender: EventSender,
    orders: OrderService,
    provider: Arc<dyn CourierProvider>,
    breaker: Arc<CircuitBreaker>,
    otp_limiter: Arc<RateLimiter>,
    idempotency: Arc<IdempotencyGuard>,
    provider_timeout: Duration,
}

impl DispatchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        event_sender: EventSender,
        orders: OrderService,
        provider: Arc<dyn CourierProvider>,
        breaker: Arc<CircuitBreaker>,
        otp_limiter: Arc<RateLimiter>,
        idempotency: Arc<IdempotencyGuard>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            event_sender,
            orders,
            provider,
            breaker,
            otp_limiter,
            idempotency,
            provider_timeout,
        }
    }

    fn generate_otp() -> String {
        format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
    }

    fn ensure_participant(
        order: &Order,
        actor: &Actor,
        claimed_pharmacy: Option<Uuid>,
    ) -> Result<(), ServiceError> {
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

    /// Runs one provider call behind the circuit breaker with the configured
    /// timeout. A timeout counts as a breaker failure: a provider that keeps
    /// hanging should stop receiving traffic just like one that errors.
    async fn provider_call<R, F, Fut>(&self, f: F) -> Result<R, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<R, ProviderError>>,
    {
        let timeout = self.provider_timeout;
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, f()).await {
                    Ok(inner) => inner.map_err(ProviderCallError::Provider),
                    Err(_) => Err(ProviderCallError::Timeout),
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open) => Err(ServiceError::CircuitOpen),
            Err(CircuitBreakerError::Inner(ProviderCallError::Timeout)) => {
                Err(ServiceError::ExternalTimeout)
            }
            Err(CircuitBreakerError::Inner(ProviderCallError::Provider(err))) => match err {
                ProviderError::Unavailable(msg) => Err(ServiceError::DispatchUnavailable(msg)),
                ProviderError::Rejected(msg) | ProviderError::Transport(msg) => {
                    Err(ServiceError::ExternalProviderError(msg))
                }
            },
        }
    }

    async fn emit_dispatch_transition(
        &self,
        dispatch: &Dispatch,
        from: DispatchStatus,
        actor: Actor,
    ) {
        if let Err(e) = self
            .event_sender
            .send(Event::DispatchStatusChanged {
                dispatch_id: dispatch.dispatch_id,
                order_id: dispatch.order_id,
                from,
                to: dispatch.status,
                at: dispatch.updated_at,
                actor,
            })
            .await
        {
            warn!(error = %e, dispatch_id = %dispatch.dispatch_id, "failed to emit dispatch transition event");
        }
    }

    /// Moves a dispatch to `next` (legality already established by the
    /// caller), commits, and emits. Caller must hold the order lock.
    async fn commit_dispatch_transition(
        &self,
        mut dispatch: Dispatch,
        next: DispatchStatus,
        actor: Actor,
    ) -> Result<Dispatch, ServiceError> {
        let from = dispatch.status;
        dispatch.set_status(next);
        self.store
            .commit_dispatch(dispatch.clone())
            .map_err(|e| ServiceError::PersistenceError(e.to_string()))?;
        self.emit_dispatch_transition(&dispatch, from, actor).await;
        Ok(dispatch)
    }

    /// Mirrors courier progress onto the owning order, inserting the
    /// IN_TRANSIT step when the courier jumps straight to delivered so the
    /// recorded history has no gaps. Caller must hold the order lock.
    async fn mirror_order_to(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        actor: Actor,
    ) -> Result<(), ServiceError> {
        let order = self.store.get_order(order_id)?;
        if order.status == target {
            return Ok(());
        }
        if target == OrderStatus::Delivered && order.status == OrderStatus::Dispatched {
            self.orders
                .transition_locked(order_id, OrderStatus::InTransit, actor.clone(), |_| {})
                .await?;
        }
        self.orders
            .transition_locked(order_id, target, actor, |_| {})
            .await?;
        Ok(())
    }

    /// Looks up the active dispatch for an order, creating one lazily.
    /// Returns an error if the active dispatch has already been booked.
    /// Caller must hold the order lock.
    async fn active_or_new_dispatch(&self, order: &Order) -> Result<Dispatch, ServiceError> {
        if let Some(dispatch_id) = order.dispatch_id {
            let dispatch = self.store.get_dispatch(dispatch_id)?;
            if !dispatch.status.is_terminal() {
                return Ok(dispatch);
            }
        }

        let dispatch = Dispatch::new(order.order_id);
        self.store.insert_dispatch(dispatch.clone());

        let mut order = order.clone();
        order.dispatch_id = Some(dispatch.dispatch_id);
        self.store
            .commit_order(order)
            .map_err(|e| ServiceError::PersistenceError(e.to_string()))?;

        if let Err(e) = self
            .event_sender
            .send(Event::DispatchCreated {
                dispatch_id: dispatch.dispatch_id,
                order_id: dispatch.order_id,
            })
            .await
        {
            warn!(error = %e, dispatch_id = %dispatch.dispatch_id, "failed to emit dispatch created event");
        }
        Ok(dispatch)
    }

    fn ensure_bookable(order: &Order) -> Result<(), ServiceError> {
        match order.status {
            OrderStatus::Paid | OrderStatus::Failed => Ok(()),
            from => Err(ServiceError::invalid_order_transition(
                order.order_id,
                from,
                OrderStatus::Dispatched,
            )),
        }
    }

    /// Asks the provider for a delivery charge and records it on the
    /// dispatch.
    #[instrument(skip(self, actor, destination))]
    pub async fn quote(
        &self,
        order_id: Uuid,
        destination: Destination,
        actor: Actor,
        claimed_pharmacy: Option<Uuid>,
    ) -> Result<DispatchResponse, ServiceError> {
        destination.validate()?;

        let dispatch_id = {
            let _guard = self.store.lock_order(order_id).await;
            let order = self.store.get_order(order_id)?;
            Self::ensure_participant(&order, &actor, claimed_pharmacy)?;
            Self::ensure_bookable(&order)?;
            let dispatch = self.active_or_new_dispatch(&order).await?;
            if !matches!(dispatch.status, DispatchStatus::Created | DispatchStatus::Quoted) {
                return Err(ServiceError::invalid_dispatch_transition(
                    dispatch.dispatch_id,
                    dispatch.status,
                    DispatchStatus::Quoted,
                ));
            }
            dispatch.dispatch_id
        };

        // Lock released: external call with bounded timeout.
        let quote = {
            let provider = self.provider.clone();
            let destination = destination.clone();
            self.provider_call(move || async move { provider.quote(dispatch_id, &destination).await })
                .await?
        };

        let _guard = self.store.lock_order(order_id).await;
        let dispatch = self.store.get_dispatch(dispatch_id)?;
        if !dispatch.status.can_transition_to(DispatchStatus::Quoted) {
            // Quoting raced a cancellation; the quote is worthless but harmless.
            return Err(ServiceError::invalid_dispatch_transition(
                dispatch_id,
                dispatch.status,
                DispatchStatus::Quoted,
            ));
        }

        let mut dispatch = dispatch;
        dispatch.provider = Some(quote.provider);
        dispatch.delivery_charge_minor = Some(quote.delivery_charge_minor);
        dispatch.destination = Some(destination);
        let dispatch = self
            .commit_dispatch_transition(dispatch, DispatchStatus::Quoted, actor)
            .await?;
        Ok(DispatchResponse::from(&dispatch))
    }

    /// Books a courier for a paid order. On provider failure the order stays
    /// PAID and the same idempotency key is safe to retry.
    #[instrument(skip(self, actor, destination), fields(order_id = %order_id))]
    pub async fn book(
        &self,
        order_id: Uuid,
        destination: Destination,
        actor: Actor,
        claimed_pharmacy: Option<Uuid>,
        idempotency_key: &str,
    ) -> Result<BookingResult, ServiceError> {
        destination.validate()?;

        let cache_key = format!("book_dispatch:{idempotency_key}");
        if let Some(stored) = self.idempotency.lookup::<BookingResult>(&cache_key)? {
            info!(dispatch_id = %stored.dispatch.dispatch_id, "replayed book_dispatch from idempotency store");
            return Ok(stored);
        }

        // Phase 1: validate and reserve a dispatch record under the lock.
        let dispatch_id = {
            let _guard = self.store.lock_order(order_id).await;
            let order = self.store.get_order(order_id)?;
            Self::ensure_participant(&order, &actor, claimed_pharmacy)?;
            Self::ensure_bookable(&order)?;

            let mut dispatch = self.active_or_new_dispatch(&order).await?;
            if !dispatch.status.can_transition_to(DispatchStatus::Booked) {
                return Err(ServiceError::invalid_dispatch_transition(
                    dispatch.dispatch_id,
                    dispatch.status,
                    DispatchStatus::Booked,
                ));
            }
            dispatch.destination = Some(destination.clone());
            self.store
                .commit_dispatch(dispatch.clone())
                .map_err(|e| ServiceError::PersistenceError(e.to_string()))?;
            dispatch.dispatch_id
        };

        // Phase 2: provider call, lock released.
        let confirmation = {
            let provider = self.provider.clone();
            let dest = destination.clone();
            self.provider_call(move || async move { provider.book(dispatch_id, &dest).await })
                .await?
        };

        // Phase 3: re-acquire, re-validate, apply or void.
        let _guard = self.store.lock_order(order_id).await;
        let order = self.store.get_order(order_id)?;
        let dispatch = self.store.get_dispatch(dispatch_id)?;

        let still_applicable = matches!(order.status, OrderStatus::Paid | OrderStatus::Failed)
            && dispatch.status.can_transition_to(DispatchStatus::Booked);
        if !still_applicable {
            // The booking exists at the provider but local state moved on
            // (e.g. staff cancelled while we were on the wire). Void it.
            warn!(
                dispatch_id = %dispatch_id,
                order_status = %order.status,
                dispatch_status = %dispatch.status,
                "state changed during booking; voiding provider booking"
            );
            let provider = self.provider.clone();
            let reference = confirmation.booking_reference.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.cancel(&reference).await {
                    warn!(error = %e, reference = %reference, "failed to void orphaned booking");
                }
            });
            return Err(ServiceError::InvalidOperation(
                "order state changed while booking was in flight; booking voided".to_string(),
            ));
        }

        let mut dispatch = dispatch;
        dispatch.provider = Some(confirmation.provider);
        dispatch.booking_reference = Some(confirmation.booking_reference);
        dispatch.delivery_charge_minor = Some(confirmation.delivery_charge_minor);
        dispatch.tracking_url = Some(confirmation.tracking_url);
        let otp = Self::generate_otp();
        dispatch.otp = Some(otp.clone());
        let dispatch = self
            .commit_dispatch_transition(dispatch, DispatchStatus::Booked, actor.clone())
            .await?;

        self.orders
            .transition_locked(order_id, OrderStatus::Dispatched, actor, |_| {})
            .await?;

        let result = BookingResult {
            dispatch: DispatchResponse::from(&dispatch),
            delivery_code: otp,
        };
        self.idempotency.store(&cache_key, &result)?;
        info!(dispatch_id = %dispatch_id, order_id = %order_id, "dispatch booked");
        Ok(result)
    }

    /// Confirms physical handoff with the delivery code. Attempts are
    /// rate-limited per dispatch; a wrong code never consumes the OTP.
    #[instrument(skip(self, code), fields(dispatch_id = %dispatch_id))]
    pub async fn verify_otp(
        &self,
        dispatch_id: Uuid,
        code: &str,
        idempotency_key: &str,
    ) -> Result<VerifyOtpResponse, ServiceError> {
        let cache_key = format!("verify_otp:{idempotency_key}");
        if let Some(stored) = self.idempotency.lookup::<VerifyOtpResponse>(&cache_key)? {
            return Ok(stored);
        }

        let order_id = self.store.get_dispatch(dispatch_id)?.order_id;
        let _guard = self.store.lock_order(order_id).await;
        let dispatch = self.store.get_dispatch(dispatch_id)?;

        if !self.otp_limiter.check_and_count(&format!("otp:{dispatch_id}")) {
            warn!(dispatch_id = %dispatch_id, "OTP verification rate limit hit");
            return Err(ServiceError::RateLimitExceeded);
        }

        if dispatch.status != DispatchStatus::InTransit {
            return Err(ServiceError::invalid_dispatch_transition(
                dispatch_id,
                dispatch.status,
                DispatchStatus::Delivered,
            ));
        }

        match dispatch.otp.as_deref() {
            Some(stored_code) if stored_code == code => {}
            _ => {
                info!(dispatch_id = %dispatch_id, "OTP mismatch");
                return Err(ServiceError::OtpMismatch);
            }
        }

        // Consume the OTP before the terminal transition: verified exactly
        // once, never reusable.
        let mut dispatch = dispatch;
        dispatch.otp = None;
        dispatch.otp_verified_at = Some(Utc::now());
        let dispatch = self
            .commit_dispatch_transition(dispatch, DispatchStatus::Delivered, Actor::DispatchProvider)
            .await?;
        self.otp_limiter.reset(&format!("otp:{dispatch_id}"));

        self.mirror_order_to(order_id, OrderStatus::Delivered, Actor::DispatchProvider)
            .await?;

        let response = VerifyOtpResponse {
            success: true,
            dispatch: DispatchResponse::from(&dispatch),
        };
        self.idempotency.store(&cache_key, &response)?;
        info!(dispatch_id = %dispatch_id, "delivery confirmed");
        Ok(response)
    }

    /// Cancels a dispatch before pickup. The owning order returns to PAID so
    /// a fresh booking can be attached.
    #[instrument(skip(self, actor))]
    pub async fn cancel(
        &self,
        dispatch_id: Uuid,
        actor: Actor,
        claimed_pharmacy: Option<Uuid>,
    ) -> Result<DispatchResponse, ServiceError> {
        let order_id = self.store.get_dispatch(dispatch_id)?.order_id;

        let booking_reference = {
            let _guard = self.store.lock_order(order_id).await;
            let order = self.store.get_order(order_id)?;
            Self::ensure_participant(&order, &actor, claimed_pharmacy)?;
            let dispatch = self.store.get_dispatch(dispatch_id)?;
            if !dispatch.status.cancellation_window_open() {
                return Err(ServiceError::CancellationWindowClosed {
                    dispatch_id,
                    status: dispatch.status,
                });
            }
            dispatch.booking_reference.clone()
        };

        // Tell the provider first, outside the lock. A failure here is logged
        // but not fatal: possession has not transferred yet.
        if let Some(reference) = booking_reference {
            let provider = self.provider.clone();
            let call = self
                .provider_call(move || async move { provider.cancel(&reference).await })
                .await;
            if let Err(e) = call {
                warn!(error = %e, dispatch_id = %dispatch_id, "provider cancellation failed; cancelling locally");
            }
        }

        let _guard = self.store.lock_order(order_id).await;
        let dispatch = self.store.get_dispatch(dispatch_id)?;
        if !dispatch.status.cancellation_window_open() {
            // Pickup happened while we were talking to the provider.
            return Err(ServiceError::CancellationWindowClosed {
                dispatch_id,
                status: dispatch.status,
            });
        }

        let dispatch = self
            .commit_dispatch_transition(dispatch, DispatchStatus::Canceled, actor.clone())
            .await?;

        let order = self.store.get_order(order_id)?;
        if matches!(order.status, OrderStatus::Dispatched | OrderStatus::InTransit) {
            self.orders
                .transition_locked(order_id, OrderStatus::Paid, actor, |_| {})
                .await?;
        }

        Ok(DispatchResponse::from(&dispatch))
    }

    /// Applies one provider-pushed status update. Stale reports (illegal for
    /// the dispatch's current state) are absorbed, not errors — they are the
    /// expected race between webhooks and authoritative state.
    pub(crate) async fn apply_provider_status(
        &self,
        dispatch_id: Uuid,
        reported: DispatchStatus,
        driver_phone_masked: Option<String>,
        tracking_url: Option<String>,
    ) -> Result<ProviderApply, ServiceError> {
        let order_id = self.store.get_dispatch(dispatch_id)?.order_id;
        let _guard = self.store.lock_order(order_id).await;
        let dispatch = self.store.get_dispatch(dispatch_id)?;
        let actor = Actor::DispatchProvider;

        match reported {
            DispatchStatus::Assigned | DispatchStatus::PickedUp | DispatchStatus::InTransit => {
                let target_rank = reported
                    .sequence_rank()
                    .expect("courier progression states have a rank");
                let current_rank = match dispatch.status.sequence_rank() {
                    Some(rank) => rank,
                    None => {
                        return Ok(ProviderApply::Stale {
                            reason: format!("dispatch is {}, ignoring {reported}", dispatch.status),
                        })
                    }
                };
                let booked_rank = DispatchStatus::Booked
                    .sequence_rank()
                    .expect("booked has a rank");
                if current_rank < booked_rank {
                    return Ok(ProviderApply::Stale {
                        reason: format!("dispatch is {}, not booked yet", dispatch.status),
                    });
                }
                if current_rank >= target_rank {
                    return Ok(ProviderApply::Stale {
                        reason: format!("dispatch is {}, ignoring {reported}", dispatch.status),
                    });
                }

                let mut dispatch = dispatch;
                if let Some(phone) = driver_phone_masked {
                    dispatch.driver_phone_masked = Some(phone);
                }
                if let Some(url) = tracking_url {
                    dispatch.tracking_url = Some(url);
                }
                // Replay any skipped steps so the recorded progression stays
                // gapless even when intermediate webhooks were lost.
                const CHAIN: [DispatchStatus; 7] = [
                    DispatchStatus::Created,
                    DispatchStatus::Quoted,
                    DispatchStatus::Booked,
                    DispatchStatus::Assigned,
                    DispatchStatus::PickedUp,
                    DispatchStatus::InTransit,
                    DispatchStatus::Delivered,
                ];
                for step in CHAIN
                    .iter()
                    .copied()
                    .filter(|s| s.sequence_rank().unwrap() > current_rank && s.sequence_rank().unwrap() <= target_rank)
                {
                    dispatch = self
                        .commit_dispatch_transition(dispatch, step, actor.clone())
                        .await?;
                }
                if reported == DispatchStatus::InTransit {
                    self.mirror_order_to(order_id, OrderStatus::InTransit, actor)
                        .await?;
                }
                Ok(ProviderApply::Applied)
            }

            DispatchStatus::Delivered => {
                // Delivery is only ever confirmed through the OTP path.
                let reason = if dispatch.status == DispatchStatus::Delivered {
                    "already delivered".to_string()
                } else {
                    format!(
                        "provider reported delivery but dispatch is {}; awaiting delivery-code confirmation",
                        dispatch.status
                    )
                };
                Ok(ProviderApply::Stale { reason })
            }

            DispatchStatus::Failed => {
                if !dispatch.status.can_transition_to(DispatchStatus::Failed) {
                    return Ok(ProviderApply::Stale {
                        reason: format!("dispatch is {}, ignoring failure report", dispatch.status),
                    });
                }
                self.commit_dispatch_transition(dispatch, DispatchStatus::Failed, actor.clone())
                    .await?;
                let order = self.store.get_order(order_id)?;
                if matches!(order.status, OrderStatus::Dispatched | OrderStatus::InTransit) {
                    // Non-recoverable on the courier side; staff re-books manually.
                    self.orders
                        .transition_locked(order_id, OrderStatus::Failed, actor, |_| {})
                        .await?;
                }
                Ok(ProviderApply::Applied)
            }

            DispatchStatus::Canceled => {
                if !dispatch.status.cancellation_window_open() {
                    return Ok(ProviderApply::Stale {
                        reason: format!("dispatch is {}, ignoring cancellation", dispatch.status),
                    });
                }
                self.commit_dispatch_transition(dispatch, DispatchStatus::Canceled, actor.clone())
                    .await?;
                let order = self.store.get_order(order_id)?;
                if matches!(order.status, OrderStatus::Dispatched | OrderStatus::InTransit) {
                    self.orders
                        .transition_locked(order_id, OrderStatus::Paid, actor, |_| {})
                        .await?;
                }
                Ok(ProviderApply::Applied)
            }

            DispatchStatus::Created | DispatchStatus::Quoted | DispatchStatus::Booked => {
                Ok(ProviderApply::Stale {
                    reason: format!("{reported} is not a provider-reportable state"),
                })
            }
        }
    }

    pub fn get_dispatch(&self, dispatch_id: Uuid) -> Result<DispatchResponse, ServiceError> {
        Ok(DispatchResponse::from(&self.store.get_dispatch(dispatch_id)?))
    }
}

#[derive(Debug)]
enum ProviderCallError {
    Timeout,
    Provider(ProviderError),
}
