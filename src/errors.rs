use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DispatchStatus, OrderStatus};

/// Standard JSON error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Conflict").
    pub error: String,
    /// Human-readable description, precise enough for the console to present
    /// an actionable message.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The requested state change is not in the transition table.
    #[error("invalid transition: {entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("no courier provider can accept this dispatch: {0}")]
    DispatchUnavailable(String),

    #[error("cancellation window closed: dispatch {dispatch_id} already reached {status}")]
    CancellationWindowClosed {
        dispatch_id: Uuid,
        status: DispatchStatus,
    },

    #[error("missing Idempotency-Key header on mutating request")]
    MissingIdempotencyKey,

    #[error("delivery code does not match")]
    OtpMismatch,

    /// Absorbed, never surfaced as a failure: an inbound event that proposes a
    /// transition the entity has already moved past.
    #[error("stale event for {entity} {id}: {detail}")]
    StaleEvent {
        entity: &'static str,
        id: Uuid,
        detail: String,
    },

    #[error("actor does not own this resource: {0}")]
    NotParticipant(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("persistence error: {0}")]
    PersistenceError(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("external provider timed out; retry with the same idempotency key")]
    ExternalTimeout,

    #[error("courier provider circuit open")]
    CircuitOpen,

    #[error("external provider error: {0}")]
    ExternalProviderError(String),

    #[error("event error: {0}")]
    EventError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    pub fn invalid_order_transition(id: Uuid, from: OrderStatus, to: OrderStatus) -> Self {
        ServiceError::InvalidTransition {
            entity: "order",
            id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invalid_dispatch_transition(id: Uuid, from: DispatchStatus, to: DispatchStatus) -> Self {
        ServiceError::InvalidTransition {
            entity: "dispatch",
            id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::MissingIdempotencyKey => StatusCode::BAD_REQUEST,
            Self::InvalidTransition { .. }
            | Self::CancellationWindowClosed { .. }
            | Self::InvalidOperation(_) => StatusCode::CONFLICT,
            Self::OtpMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotParticipant(_) => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::DispatchUnavailable(_) | Self::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExternalTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ExternalProviderError(_) => StatusCode::BAD_GATEWAY,
            // Absorbed upstream; if one escapes to HTTP it is a server bug.
            Self::StaleEvent { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PersistenceError(_)
            | Self::EventError(_)
            | Self::SerializationError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message suitable for HTTP responses. Internal failures return generic
    /// text so implementation details never leak.
    pub fn response_message(&self) -> String {
        match self {
            Self::PersistenceError(_)
            | Self::EventError(_)
            | Self::SerializationError(_)
            | Self::StaleEvent { .. }
            | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            request_id: crate::request_id::current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surfaced_errors_map_to_client_statuses() {
        let err = ServiceError::invalid_order_transition(
            Uuid::new_v4(),
            OrderStatus::Delivered,
            OrderStatus::Confirmed,
        );
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(ServiceError::OtpMismatch.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            ServiceError::MissingIdempotencyKey.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::DispatchUnavailable("all providers declined".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = ServiceError::PersistenceError("order table corrupt".into());
        assert_eq!(err.response_message(), "Internal server error");
    }
}
