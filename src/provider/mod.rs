//! Courier provider integration.
//!
//! The dispatch machine talks to logistics providers through the
//! `CourierProvider` trait. Two implementations: an HTTP client for real
//! providers, and a deterministic in-process provider for development and
//! tests. Timeouts and circuit breaking are applied by the dispatch service,
//! not here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Destination;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// No courier can accept the request right now; safe to retry later.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// The provider rejected this specific request; retrying unchanged will
    /// not help.
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("provider transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub provider: String,
    pub delivery_charge_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfirmation {
    pub provider: String,
    pub booking_reference: String,
    pub delivery_charge_minor: i64,
    pub tracking_url: String,
}

#[async_trait]
pub trait CourierProvider: Send + Sync {
    async fn quote(&self, dispatch_id: Uuid, destination: &Destination)
        -> Result<Quote, ProviderError>;

    async fn book(
        &self,
        dispatch_id: Uuid,
        destination: &Destination,
    ) -> Result<BookingConfirmation, ProviderError>;

    async fn cancel(&self, booking_reference: &str) -> Result<(), ProviderError>;
}

/// Deterministic in-process provider for development and tests. Always
/// quotes the same charge; bookings can be forced to fail to exercise the
/// `DispatchUnavailable` path.
#[derive(Debug)]
pub struct StaticCourierProvider {
    pub name: String,
    pub delivery_charge_minor: i64,
    pub fail_bookings: bool,
}

impl Default for StaticCourierProvider {
    fn default() -> Self {
        Self {
            name: "static-courier".to_string(),
            delivery_charge_minor: 150_000,
            fail_bookings: false,
        }
    }
}

impl StaticCourierProvider {
    pub fn failing() -> Self {
        Self {
            fail_bookings: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl CourierProvider for StaticCourierProvider {
    async fn quote(
        &self,
        _dispatch_id: Uuid,
        _destination: &Destination,
    ) -> Result<Quote, ProviderError> {
        Ok(Quote {
            provider: self.name.clone(),
            delivery_charge_minor: self.delivery_charge_minor,
        })
    }

    async fn book(
        &self,
        dispatch_id: Uuid,
        _destination: &Destination,
    ) -> Result<BookingConfirmation, ProviderError> {
        if self.fail_bookings {
            return Err(ProviderError::Unavailable(
                "no couriers in service area".to_string(),
            ));
        }
        Ok(BookingConfirmation {
            provider: self.name.clone(),
            booking_reference: format!("BK-{}", &dispatch_id.simple().to_string()[..12]),
            delivery_charge_minor: self.delivery_charge_minor,
            tracking_url: format!("https://track.{}.example/{}", self.name, dispatch_id),
        })
    }

    async fn cancel(&self, _booking_reference: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

// Wire DTOs for the HTTP provider.

#[derive(Debug, Serialize)]
struct BookingRequest<'a> {
    dispatch_id: Uuid,
    destination: &'a Destination,
}

#[derive(Debug, Deserialize)]
struct QuoteWire {
    provider: String,
    delivery_charge_minor: i64,
}

#[derive(Debug, Deserialize)]
struct BookingWire {
    provider: String,
    booking_reference: String,
    delivery_charge_minor: i64,
    tracking_url: String,
}

/// JSON-over-HTTP provider client. The service wraps every call in a bounded
/// timeout; this client only maps transport and status failures.
#[derive(Debug, Clone)]
pub struct HttpCourierProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCourierProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn map_response_error(status: reqwest::StatusCode, body: String) -> ProviderError {
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            ProviderError::Unavailable(body)
        } else if status.is_client_error() {
            ProviderError::Rejected(body)
        } else {
            ProviderError::Transport(format!("status {status}: {body}"))
        }
    }
}

#[async_trait]
impl CourierProvider for HttpCourierProvider {
    async fn quote(
        &self,
        dispatch_id: Uuid,
        destination: &Destination,
    ) -> Result<Quote, ProviderError> {
        let response = self
            .client
            .post(format!("{}/quotes", self.base_url))
            .json(&BookingRequest {
                dispatch_id,
                destination,
            })
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_response_error(status, body));
        }
        let wire: QuoteWire = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Quote {
            provider: wire.provider,
            delivery_charge_minor: wire.delivery_charge_minor,
        })
    }

    async fn book(
        &self,
        dispatch_id: Uuid,
        destination: &Destination,
    ) -> Result<BookingConfirmation, ProviderError> {
        let response = self
            .client
            .post(format!("{}/bookings", self.base_url))
            .json(&BookingRequest {
                dispatch_id,
                destination,
            })
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_response_error(status, body));
        }
        let wire: BookingWire = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(BookingConfirmation {
            provider: wire.provider,
            booking_reference: wire.booking_reference,
            delivery_charge_minor: wire.delivery_charge_minor,
            tracking_url: wire.tracking_url,
        })
    }

    async fn cancel(&self, booking_reference: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(format!("{}/bookings/{}/cancel", self.base_url, booking_reference))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_response_error(status, body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> Destination {
        Destination {
            latitude: 6.5244,
            longitude: 3.3792,
            address: "23 Marina Rd, Lagos Island".into(),
        }
    }

    #[tokio::test]
    async fn static_provider_books_deterministically() {
        let provider = StaticCourierProvider::default();
        let id = Uuid::new_v4();
        let booking = provider.book(id, &destination()).await.unwrap();
        assert!(booking.booking_reference.starts_with("BK-"));
        assert_eq!(booking.delivery_charge_minor, 150_000);
    }

    #[tokio::test]
    async fn failing_provider_reports_unavailable() {
        let provider = StaticCourierProvider::failing();
        let err = provider
            .book(Uuid::new_v4(), &destination())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
