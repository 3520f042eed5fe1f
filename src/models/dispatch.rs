use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Courier-side lifecycle of a single delivery attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum DispatchStatus {
    Created,
    Quoted,
    Booked,
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Canceled,
    Failed,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Delivered | DispatchStatus::Canceled | DispatchStatus::Failed
        )
    }

    /// Physical possession transfers at pickup; cancellation is rejected from
    /// then on.
    pub fn cancellation_window_open(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Created
                | DispatchStatus::Quoted
                | DispatchStatus::Booked
                | DispatchStatus::Assigned
        )
    }

    /// Position in the linear courier progression, `None` for the terminal
    /// side-exits. Used to replay skipped steps when a provider's
    /// intermediate webhooks were lost.
    pub fn sequence_rank(&self) -> Option<u8> {
        match self {
            DispatchStatus::Created => Some(0),
            DispatchStatus::Quoted => Some(1),
            DispatchStatus::Booked => Some(2),
            DispatchStatus::Assigned => Some(3),
            DispatchStatus::PickedUp => Some(4),
            DispatchStatus::InTransit => Some(5),
            DispatchStatus::Delivered => Some(6),
            DispatchStatus::Canceled | DispatchStatus::Failed => None,
        }
    }

    pub fn can_transition_to(self, next: DispatchStatus) -> bool {
        use DispatchStatus::*;
        match (self, next) {
            (Created, Quoted) => true,
            (Created | Quoted, Booked) => true,
            (Booked, Assigned) => true,
            (Assigned, PickedUp) => true,
            (PickedUp, InTransit) => true,
            (InTransit, Delivered) => true,
            (Created | Quoted | Booked | Assigned, Canceled) => true,
            (Booked | Assigned | PickedUp | InTransit, Failed) => true,
            _ => false,
        }
    }
}

/// Delivery destination. Coordinates are validated at the boundary; the
/// address string is whatever the upstream console resolved (autocomplete and
/// geocoding live outside this service).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
}

impl Destination {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ServiceError::ValidationError(format!(
                "latitude {} out of range",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ServiceError::ValidationError(format!(
                "longitude {} out of range",
                self.longitude
            )));
        }
        if self.address.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "destination address is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    pub dispatch_id: Uuid,
    pub order_id: Uuid,
    pub status: DispatchStatus,
    pub provider: Option<String>,
    /// Provider's reference for the booking, used for cancellation calls.
    pub booking_reference: Option<String>,
    pub delivery_charge_minor: Option<i64>,
    pub tracking_url: Option<String>,
    pub driver_phone_masked: Option<String>,
    pub destination: Option<Destination>,
    /// 6-digit delivery code. Present from booking until consumed; cleared on
    /// successful verification so it can never match twice.
    #[serde(skip_serializing, default)]
    pub otp: Option<String>,
    pub otp_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dispatch {
    pub fn new(order_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            dispatch_id: Uuid::new_v4(),
            order_id,
            status: DispatchStatus::Created,
            provider: None,
            booking_reference: None,
            delivery_charge_minor: None,
            tracking_url: None,
            driver_phone_masked: None,
            destination: None,
            otp: None,
            otp_verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, next: DispatchStatus) {
        self.status = next;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn courier_path_is_legal_in_order() {
        use DispatchStatus::*;
        let path = [Created, Quoted, Booked, Assigned, PickedUp, InTransit, Delivered];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn booking_may_skip_the_quote() {
        assert!(DispatchStatus::Created.can_transition_to(DispatchStatus::Booked));
    }

    #[test]
    fn cancellation_window_closes_at_pickup() {
        use DispatchStatus::*;
        for open in [Created, Quoted, Booked, Assigned] {
            assert!(open.cancellation_window_open(), "{open}");
            assert!(open.can_transition_to(Canceled), "{open}");
        }
        for closed in [PickedUp, InTransit, Delivered, Canceled, Failed] {
            assert!(!closed.cancellation_window_open(), "{closed}");
            assert!(!closed.can_transition_to(Canceled), "{closed}");
        }
    }

    #[test]
    fn delivered_requires_transit() {
        use DispatchStatus::*;
        for not_in_transit in [Created, Quoted, Booked, Assigned, PickedUp] {
            assert!(!not_in_transit.can_transition_to(Delivered));
        }
        assert!(InTransit.can_transition_to(Delivered));
    }

    #[test]
    fn destination_coordinates_are_bounded() {
        let valid = Destination {
            latitude: 6.5244,
            longitude: 3.3792,
            address: "23 Marina Rd, Lagos Island".into(),
        };
        assert!(valid.validate().is_ok());

        let bad_lat = Destination {
            latitude: 91.0,
            ..valid.clone()
        };
        assert!(bad_lat.validate().is_err());

        let no_address = Destination {
            address: "  ".into(),
            ..valid
        };
        assert!(no_address.validate().is_err());
    }

    #[test]
    fn status_normalizes_at_the_edge() {
        assert_eq!(
            DispatchStatus::from_str("picked_up").unwrap(),
            DispatchStatus::PickedUp
        );
        assert_eq!(DispatchStatus::PickedUp.to_string(), "PICKED_UP");
        assert_eq!(DispatchStatus::Canceled.to_string(), "CANCELED");
    }
}
