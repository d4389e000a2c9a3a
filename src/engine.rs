// Booking admission: slot validation, reference checks, overlap check and atomic insert

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{info, instrument, warn};

use crate::{
    booking::{Booking, BookingId, BookingStatus, NewBooking, Permission, RoomId, SlotChange, SlotRow, TimeSlot, UserId},
    dependency::ReferenceValidator,
    error::BookingError,
    store::{BookingStore, StoreError},
};

pub struct BookingAvailabilityEngine {
    store: Arc<dyn BookingStore>,
    references: Arc<ReferenceValidator>,
}

impl BookingAvailabilityEngine {
    pub fn new(store: Arc<dyn BookingStore>, references: Arc<ReferenceValidator>) -> Self {
        Self { store, references }
    }

    // The store's conditional insert, not the pre-check, decides between racing requests
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        user_id: UserId,
        room_id: RoomId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Booking, BookingError> {
        let slot = TimeSlot::new(start, end)?;

        // both checks run to completion so neither circuit sees a dropped call
        let (user, room) = futures::join!(
            self.references.ensure_user(user_id),
            self.references.ensure_room(room_id)
        );
        user?;
        room?;

        let conflicting = self.conflicting_ids(room_id, date, &slot, None).await?;
        if !conflicting.is_empty() {
            return Err(self.overlap(room_id, date, conflicting));
        }

        let booking = self
            .store
            .insert_if_no_overlap(NewBooking {
                user_id,
                room_id,
                date,
                slot,
            })
            .await
            .map_err(|e| self.store_error(e))?;

        info!(booking_id = %booking.id, "booking confirmed");
        Ok(booking)
    }

    pub async fn check_availability(
        &self,
        room_id: RoomId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<bool, BookingError> {
        let slot = TimeSlot::new(start, end)?;
        Ok(self.conflicting_ids(room_id, date, &slot, None).await?.is_empty())
    }

    pub async fn conflicts(
        &self,
        room_id: RoomId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Vec<SlotRow>, BookingError> {
        let slot = TimeSlot::new(start, end)?;
        let rows = self.store.list_confirmed(room_id, date).await?;
        Ok(rows.into_iter().filter(|r| r.slot.overlaps(&slot)).collect())
    }

    // Terminal bookings can only be moved by an administrator, which confirms them again
    #[instrument(skip(self, change))]
    pub async fn reschedule(
        &self,
        id: BookingId,
        permission: Permission,
        change: SlotChange,
    ) -> Result<Booking, BookingError> {
        let current = self.load(id).await?;
        if !permission.may_act_for(current.user_id) {
            return Err(BookingError::Forbidden(
                "you can only update your own bookings".to_string(),
            ));
        }
        if current.status.is_terminal() && !permission.is_admin() {
            return Err(BookingError::InvalidTransition {
                id,
                from: current.status,
                to: BookingStatus::Confirmed,
            });
        }

        let room_id = change.room_id.unwrap_or(current.room_id);
        let date = change.date.unwrap_or(current.date);
        let slot = TimeSlot::new(
            change.start_time.unwrap_or(current.slot.start()),
            change.end_time.unwrap_or(current.slot.end()),
        )?;

        let unchanged = room_id == current.room_id && date == current.date && slot == current.slot;
        if unchanged && current.status == BookingStatus::Confirmed {
            return Ok(current);
        }

        if room_id != current.room_id {
            self.references.ensure_room(room_id).await?;
        }

        let conflicting = self.conflicting_ids(room_id, date, &slot, Some(id)).await?;
        if !conflicting.is_empty() {
            return Err(self.overlap(room_id, date, conflicting));
        }

        let booking = self
            .store
            .reschedule_if_no_overlap(id, room_id, date, slot)
            .await
            .map_err(|e| self.store_error(e))?;

        if current.status.is_terminal() {
            warn!(booking_id = %id, from = %current.status, "administrative override restored booking");
        }
        info!(booking_id = %id, room_id, %date, %slot, "booking rescheduled");
        Ok(booking)
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, id: BookingId, permission: Permission) -> Result<Booking, BookingError> {
        let current = self.load(id).await?;
        if !permission.may_act_for(current.user_id) {
            return Err(BookingError::Forbidden(
                "you can only cancel your own bookings".to_string(),
            ));
        }

        let allowed_from: &[BookingStatus] = if permission.is_admin() {
            &[BookingStatus::Confirmed, BookingStatus::Completed]
        } else {
            &[BookingStatus::Confirmed]
        };

        let booking = self
            .store
            .transition_status(id, allowed_from, BookingStatus::Cancelled)
            .await?;
        info!(booking_id = %id, "booking cancelled");
        Ok(booking)
    }

    #[instrument(skip(self))]
    pub async fn complete(&self, id: BookingId, permission: Permission) -> Result<Booking, BookingError> {
        if !permission.is_admin() {
            return Err(BookingError::Forbidden(
                "only administrators can complete bookings".to_string(),
            ));
        }
        let booking = self
            .store
            .transition_status(id, &[BookingStatus::Confirmed], BookingStatus::Completed)
            .await?;
        info!(booking_id = %id, "booking completed");
        Ok(booking)
    }

    pub async fn get(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.load(id).await
    }

    pub async fn room_bookings(
        &self,
        room_id: RoomId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Booking>, BookingError> {
        Ok(self.store.list_for_room(room_id, date).await?)
    }

    pub async fn user_bookings(&self, user_id: UserId) -> Result<Vec<Booking>, BookingError> {
        Ok(self.store.list_for_user(user_id).await?)
    }

    pub async fn all_bookings(&self) -> Result<Vec<Booking>, BookingError> {
        Ok(self.store.list_all().await?)
    }

    async fn load(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.store
            .get(id)
            .await?
            .ok_or(BookingError::NotFound(id))
    }

    async fn conflicting_ids(
        &self,
        room_id: RoomId,
        date: NaiveDate,
        slot: &TimeSlot,
        exclude: Option<BookingId>,
    ) -> Result<Vec<BookingId>, BookingError> {
        let rows = self.store.list_confirmed(room_id, date).await?;
        Ok(rows
            .into_iter()
            .filter(|r| Some(r.booking_id) != exclude && r.slot.overlaps(slot))
            .map(|r| r.booking_id)
            .collect())
    }

    fn overlap(&self, room_id: RoomId, date: NaiveDate, conflicting: Vec<BookingId>) -> BookingError {
        warn!(room_id, %date, ?conflicting, "slot already taken");
        BookingError::OverlapConflict {
            room_id,
            date,
            conflicting,
        }
    }

    fn store_error(&self, e: StoreError) -> BookingError {
        match e {
            StoreError::Conflict {
                room_id,
                date,
                conflicting,
            } => self.overlap(room_id, date, conflicting),
            other => other.into(),
        }
    }
}
