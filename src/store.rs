// Booking persistence contract and an in-memory implementation with serializable admission

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::booking::{Booking, BookingId, BookingStatus, NewBooking, RoomId, SlotRow, TimeSlot, UserId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Slot on room {room_id} for {date} conflicts with {conflicting:?}")]
    Conflict {
        room_id: RoomId,
        date: NaiveDate,
        conflicting: Vec<BookingId>,
    },

    #[error("Booking {0} not found")]
    NotFound(BookingId),

    #[error("Booking {id} is {actual}, cannot become {wanted}")]
    StatusMismatch {
        id: BookingId,
        actual: BookingStatus,
        wanted: BookingStatus,
    },

    #[error("Backend error: {0}")]
    Backend(String),
}

// Any write that can confirm a slot checks overlaps and writes in one atomic step
#[async_trait]
pub trait BookingStore: Send + Sync + 'static {
    async fn insert_if_no_overlap(&self, booking: NewBooking) -> Result<Booking, StoreError>;

    async fn list_confirmed(&self, room_id: RoomId, date: NaiveDate) -> Result<Vec<SlotRow>, StoreError>;

    // ignores the booking's own row when looking for overlaps
    async fn reschedule_if_no_overlap(
        &self,
        id: BookingId,
        room_id: RoomId,
        date: NaiveDate,
        slot: TimeSlot,
    ) -> Result<Booking, StoreError>;

    // no-op unless the current status is in `allowed_from`
    async fn transition_status(
        &self,
        id: BookingId,
        allowed_from: &[BookingStatus],
        to: BookingStatus,
    ) -> Result<Booking, StoreError>;

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Booking>, StoreError>;

    // every booking in any status, newest first
    async fn list_all(&self) -> Result<Vec<Booking>, StoreError>;

    // non-cancelled only
    async fn list_for_room(
        &self,
        room_id: RoomId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Booking>, StoreError>;
}

type SlotKey = (RoomId, NaiveDate, TimeSlot);

#[derive(Default)]
struct Tables {
    rows: BTreeMap<BookingId, Booking>,
    // unique index over confirmed slots
    confirmed_slots: HashSet<SlotKey>,
    next_id: u64,
}

impl Tables {
    fn conflicts(
        &self,
        room_id: RoomId,
        date: NaiveDate,
        slot: &TimeSlot,
        exclude: Option<BookingId>,
    ) -> Vec<BookingId> {
        self.rows
            .values()
            .filter(|b| {
                b.status == BookingStatus::Confirmed
                    && b.room_id == room_id
                    && b.date == date
                    && Some(b.id) != exclude
                    && b.slot.overlaps(slot)
            })
            .map(|b| b.id)
            .collect()
    }

    fn claim_slot(&mut self, key: SlotKey, conflicting: Vec<BookingId>) -> Result<(), StoreError> {
        if !conflicting.is_empty() || self.confirmed_slots.contains(&key) {
            return Err(StoreError::Conflict {
                room_id: key.0,
                date: key.1,
                conflicting,
            });
        }
        self.confirmed_slots.insert(key);
        Ok(())
    }
}

// One mutex around check and write, as strong as a serializable transaction
#[derive(Default)]
pub struct InMemoryBookingStore {
    tables: Mutex<Tables>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn insert_if_no_overlap(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let mut tables = self.tables.lock();

        let conflicting = tables.conflicts(booking.room_id, booking.date, &booking.slot, None);
        tables.claim_slot((booking.room_id, booking.date, booking.slot), conflicting)?;

        tables.next_id += 1;
        let now = Utc::now();
        let row = Booking {
            id: BookingId(tables.next_id),
            user_id: booking.user_id,
            room_id: booking.room_id,
            date: booking.date,
            slot: booking.slot,
            status: BookingStatus::Confirmed,
            created_at: now,
            updated_at: now,
        };
        tables.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_confirmed(&self, room_id: RoomId, date: NaiveDate) -> Result<Vec<SlotRow>, StoreError> {
        let tables = self.tables.lock();
        let mut slots: Vec<_> = tables
            .rows
            .values()
            .filter(|b| b.status == BookingStatus::Confirmed && b.room_id == room_id && b.date == date)
            .map(|b| SlotRow {
                booking_id: b.id,
                slot: b.slot,
            })
            .collect();
        slots.sort_by_key(|s| s.slot.start());
        Ok(slots)
    }

    async fn reschedule_if_no_overlap(
        &self,
        id: BookingId,
        room_id: RoomId,
        date: NaiveDate,
        slot: TimeSlot,
    ) -> Result<Booking, StoreError> {
        let mut tables = self.tables.lock();
        let current = tables.rows.get(&id).cloned().ok_or(StoreError::NotFound(id))?;

        let old_key = (current.room_id, current.date, current.slot);
        let held = current.status == BookingStatus::Confirmed;
        if held {
            tables.confirmed_slots.remove(&old_key);
        }

        let conflicting = tables.conflicts(room_id, date, &slot, Some(id));
        if let Err(e) = tables.claim_slot((room_id, date, slot), conflicting) {
            if held {
                tables.confirmed_slots.insert(old_key);
            }
            return Err(e);
        }

        let row = Booking {
            room_id,
            date,
            slot,
            status: BookingStatus::Confirmed,
            updated_at: Utc::now(),
            ..current
        };
        tables.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn transition_status(
        &self,
        id: BookingId,
        allowed_from: &[BookingStatus],
        to: BookingStatus,
    ) -> Result<Booking, StoreError> {
        let mut tables = self.tables.lock();
        let current = tables.rows.get(&id).cloned().ok_or(StoreError::NotFound(id))?;

        if !allowed_from.contains(&current.status) {
            return Err(StoreError::StatusMismatch {
                id,
                actual: current.status,
                wanted: to,
            });
        }

        let key = (current.room_id, current.date, current.slot);
        match (current.status, to) {
            (BookingStatus::Confirmed, BookingStatus::Confirmed) => {}
            (BookingStatus::Confirmed, _) => {
                tables.confirmed_slots.remove(&key);
            }
            (_, BookingStatus::Confirmed) => {
                let conflicting = tables.conflicts(current.room_id, current.date, &current.slot, Some(id));
                tables.claim_slot(key, conflicting)?;
            }
            _ => {}
        }

        let row = Booking {
            status: to,
            updated_at: Utc::now(),
            ..current
        };
        tables.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.tables.lock().rows.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Booking>, StoreError> {
        let tables = self.tables.lock();
        let mut bookings: Vec<_> = tables
            .rows
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        // newest first
        bookings.sort_by(|a, b| (b.date, b.slot.start()).cmp(&(a.date, a.slot.start())));
        Ok(bookings)
    }

    async fn list_all(&self) -> Result<Vec<Booking>, StoreError> {
        let tables = self.tables.lock();
        let mut bookings: Vec<_> = tables.rows.values().cloned().collect();
        bookings.sort_by(|a, b| (b.date, b.slot.start()).cmp(&(a.date, a.slot.start())));
        Ok(bookings)
    }

    async fn list_for_room(
        &self,
        room_id: RoomId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Booking>, StoreError> {
        let tables = self.tables.lock();
        let mut bookings: Vec<_> = tables
            .rows
            .values()
            .filter(|b| {
                b.room_id == room_id
                    && b.status != BookingStatus::Cancelled
                    && date.map_or(true, |d| b.date == d)
            })
            .cloned()
            .collect();
        bookings.sort_by_key(|b| (b.date, b.slot.start()));
        Ok(bookings)
    }
}
