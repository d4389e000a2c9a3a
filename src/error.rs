// User-facing error taxonomy for booking requests

use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    booking::{BookingId, BookingStatus, RoomId},
    circuit_breaker::CircuitState,
    rate_limiter::RateLimitExceeded,
    store::StoreError,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookingError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("{resource} {id} does not exist or is not bookable")]
    UnknownReference { resource: &'static str, id: i64 },

    #[error("Booking {0} not found")]
    NotFound(BookingId),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("{service} service is unavailable (circuit {state})")]
    DependencyUnavailable {
        service: String,
        state: CircuitState,
        retry_after: Option<Duration>,
    },

    #[error("Rate limit of {limit} requests per {}s exceeded for {route}", .window.as_secs())]
    RateLimitExceeded {
        route: String,
        limit: u32,
        window: Duration,
        retry_after: Duration,
    },

    #[error("Room {room_id} is already booked on {date} for the requested time slot")]
    OverlapConflict {
        room_id: RoomId,
        date: NaiveDate,
        conflicting: Vec<BookingId>,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    UnknownReference,
    NotFound,
    Forbidden,
    InvalidTransition,
    DependencyUnavailable,
    RateLimitExceeded,
    OverlapConflict,
    StorageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    WaitForWindowReset,
    WaitForCircuitRecovery,
    ChooseDifferentSlot,
    DoNotRetry,
}

impl ErrorKind {
    pub fn retry_hint(self) -> RetryHint {
        match self {
            ErrorKind::RateLimitExceeded => RetryHint::WaitForWindowReset,
            ErrorKind::DependencyUnavailable => RetryHint::WaitForCircuitRecovery,
            ErrorKind::OverlapConflict => RetryHint::ChooseDifferentSlot,
            _ => RetryHint::DoNotRetry,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: u16,
    pub retry: RetryHint,
    pub details: Value,
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::Validation { .. } => ErrorKind::ValidationError,
            BookingError::UnknownReference { .. } => ErrorKind::UnknownReference,
            BookingError::NotFound(_) => ErrorKind::NotFound,
            BookingError::Forbidden(_) => ErrorKind::Forbidden,
            BookingError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            BookingError::DependencyUnavailable { .. } => ErrorKind::DependencyUnavailable,
            BookingError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            BookingError::OverlapConflict { .. } => ErrorKind::OverlapConflict,
            BookingError::Storage(_) => ErrorKind::StorageError,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::ValidationError | ErrorKind::UnknownReference => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidTransition | ErrorKind::OverlapConflict => 409,
            ErrorKind::RateLimitExceeded => 429,
            ErrorKind::DependencyUnavailable => 503,
            ErrorKind::StorageError => 500,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            BookingError::Validation { field, .. } => json!({ "field": field }),
            BookingError::UnknownReference { resource, id } => {
                json!({ "resource": resource, "resource_id": id })
            }
            BookingError::NotFound(id) => json!({ "resource": "booking", "resource_id": id }),
            BookingError::InvalidTransition { from, to, .. } => {
                json!({ "from": from, "to": to })
            }
            BookingError::DependencyUnavailable {
                service,
                state,
                retry_after,
            } => json!({
                "service": service,
                "circuit_state": state,
                "retry_after_secs": retry_after.map(|d| d.as_secs()),
            }),
            BookingError::RateLimitExceeded {
                route,
                limit,
                window,
                retry_after,
            } => json!({
                "route": route,
                "limit": limit,
                "window_secs": window.as_secs(),
                // round up so a client never retries a moment too early
                "retry_after_secs": retry_after.as_millis().div_ceil(1000) as u64,
            }),
            BookingError::OverlapConflict {
                room_id,
                date,
                conflicting,
            } => json!({
                "room_id": room_id,
                "date": date,
                "conflicting_bookings": conflicting,
            }),
            BookingError::Forbidden(_) | BookingError::Storage(_) => json!({}),
        };

        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            status_code: self.status_code(),
            retry: self.kind().retry_hint(),
            details,
        }
    }
}

impl From<RateLimitExceeded> for BookingError {
    fn from(e: RateLimitExceeded) -> Self {
        BookingError::RateLimitExceeded {
            route: e.route,
            limit: e.limit,
            window: e.window,
            retry_after: e.retry_after,
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict {
                room_id,
                date,
                conflicting,
            } => BookingError::OverlapConflict {
                room_id,
                date,
                conflicting,
            },
            StoreError::NotFound(id) => BookingError::NotFound(id),
            StoreError::StatusMismatch { id, actual, wanted } => BookingError::InvalidTransition {
                id,
                from: actual,
                to: wanted,
            },
            StoreError::Backend(msg) => BookingError::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_body_carries_limit_and_retry_after() {
        let err = BookingError::RateLimitExceeded {
            route: "create-booking".to_string(),
            limit: 50,
            window: Duration::from_secs(3600),
            retry_after: Duration::from_millis(1500),
        };

        let body = err.to_body();
        assert_eq!(body.status_code, 429);
        assert_eq!(body.retry, RetryHint::WaitForWindowReset);
        assert_eq!(body.details["limit"], 50);
        assert_eq!(body.details["retry_after_secs"], 2);

        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(encoded["kind"], "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_dependency_unavailable_names_service_and_state() {
        let err = BookingError::DependencyUnavailable {
            service: "rooms".to_string(),
            state: CircuitState::Open,
            retry_after: Some(Duration::from_secs(42)),
        };

        let body = err.to_body();
        assert_eq!(body.status_code, 503);
        assert_eq!(body.details["service"], "rooms");
        assert_eq!(body.details["circuit_state"], "open");
        assert!(body.message.contains("rooms"));
    }

    #[test]
    fn test_store_conflict_maps_to_overlap() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 15).unwrap();
        let err: BookingError = StoreError::Conflict {
            room_id: 1,
            date,
            conflicting: vec![BookingId(3)],
        }
        .into();

        assert_eq!(err.kind(), ErrorKind::OverlapConflict);
        assert_eq!(err.kind().retry_hint(), RetryHint::ChooseDifferentSlot);
        assert_eq!(err.status_code(), 409);
    }
}
