// Booking domain types: identifiers, time slots and the booking record itself

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BookingError;

pub type UserId = i64;
pub type RoomId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(pub u64);

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::Completed => "Completed",
        };
        f.write_str(s)
    }
}

// [start, end) within one day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, BookingError> {
        if end <= start {
            return Err(BookingError::Validation {
                field: "end_time".to_string(),
                reason: format!("end time {end} must be after start time {start}"),
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    // [a,b) and [c,d) conflict iff a < d && c < b; abutting slots do not
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBooking {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub date: NaiveDate,
    pub slot: TimeSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotRow {
    pub booking_id: BookingId,
    pub slot: TimeSlot,
}

// Pre-validated authorization handed in by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    OwnBookings(UserId),
    Administer,
}

impl Permission {
    pub fn is_admin(self) -> bool {
        matches!(self, Permission::Administer)
    }

    pub fn may_act_for(self, user_id: UserId) -> bool {
        match self {
            Permission::Administer => true,
            Permission::OwnBookings(own) => own == user_id,
        }
    }
}

// None keeps the current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SlotChange {
    pub room_id: Option<RoomId>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_slot_rejects_empty_and_inverted() {
        assert!(TimeSlot::new(t(10, 0), t(10, 0)).is_err());
        assert!(TimeSlot::new(t(11, 0), t(10, 0)).is_err());
        assert!(TimeSlot::new(t(10, 0), t(10, 1)).is_ok());
    }

    #[test]
    fn test_overlap_is_half_open() {
        let a = TimeSlot::new(t(10, 0), t(11, 0)).unwrap();
        let b = TimeSlot::new(t(10, 30), t(11, 30)).unwrap();
        let c = TimeSlot::new(t(11, 0), t(12, 0)).unwrap();
        let inner = TimeSlot::new(t(10, 15), t(10, 45)).unwrap();

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(a.overlaps(&inner));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_permission_scope() {
        assert!(Permission::Administer.may_act_for(42));
        assert!(Permission::OwnBookings(7).may_act_for(7));
        assert!(!Permission::OwnBookings(7).may_act_for(8));
    }
}
