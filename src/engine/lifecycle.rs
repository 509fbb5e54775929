use tracing::{debug, info, warn};

use crate::model::*;
use crate::observability::{BOOKINGS_DISPLACED_TOTAL, BOOKINGS_RECORDED_TOTAL};
use crate::store::{AllocationStore, Isolation, Transaction};

use super::conflict::{check_not_stale, has_approved_conflict, now_ms, validate_span};
use super::{deadline_after, observe, BookingEngine, EngineError};

impl<S: AllocationStore> BookingEngine<S> {
    /// Request a room and decide immediately.
    ///
    /// Without a conflict the booking is recorded `Approved`. With one it is
    /// still recorded and committed, as `Rejected`, and returned inside
    /// [`EngineError::ConflictDetected`].
    pub async fn create(
        &self,
        room_id: RoomId,
        requester_id: RequesterId,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let started = std::time::Instant::now();
        let result = self.create_inner(room_id, requester_id, start, end).await;
        observe("create", started, &result);
        result
    }

    async fn create_inner(
        &self,
        room_id: RoomId,
        requester_id: RequesterId,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        check_not_stale(&span, now_ms())?;

        let mut tx = self
            .store
            .begin(Isolation::ReadCommitted, deadline_after(self.timeouts.create()))
            .await?;
        tx.lock_room_for_update(room_id).await?;
        let conflict =
            has_approved_conflict(&mut tx, room_id, span, None, self.timeouts.conflict_check())
                .await?;
        let status = if conflict {
            BookingStatus::Rejected
        } else {
            BookingStatus::Approved
        };
        let booking = tx
            .insert_booking(NewBooking { room_id, requester_id, span }, status)
            .await?;
        tx.commit().await?;
        metrics::counter!(BOOKINGS_RECORDED_TOTAL, "status" => status_label(status)).increment(1);

        if conflict {
            info!(booking_id = %booking.id, %room_id, "booking rejected: conflict");
            return Err(EngineError::ConflictDetected(Box::new(booking)));
        }
        info!(booking_id = %booking.id, %room_id, "booking approved");
        Ok(booking)
    }

    /// Record a `Pending` booking without deciding it. A later
    /// [`approve`](Self::approve) runs the conflict check.
    pub async fn submit(
        &self,
        room_id: RoomId,
        requester_id: RequesterId,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let started = std::time::Instant::now();
        let result = self.submit_inner(room_id, requester_id, start, end).await;
        observe("submit", started, &result);
        result
    }

    async fn submit_inner(
        &self,
        room_id: RoomId,
        requester_id: RequesterId,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        check_not_stale(&span, now_ms())?;

        let mut tx = self
            .store
            .begin(Isolation::ReadCommitted, deadline_after(self.timeouts.create()))
            .await?;
        let booking = tx
            .insert_booking(
                NewBooking { room_id, requester_id, span },
                BookingStatus::Pending,
            )
            .await?;
        tx.commit().await?;
        metrics::counter!(BOOKINGS_RECORDED_TOTAL, "status" => "pending").increment(1);
        debug!(booking_id = %booking.id, %room_id, "booking submitted");
        Ok(booking)
    }

    /// Promote a pending booking, re-checking for conflicts under the room lock.
    /// On conflict nothing changes.
    pub async fn approve(&self, id: BookingId) -> Result<Booking, EngineError> {
        let started = std::time::Instant::now();
        let result = self.approve_inner(id).await;
        observe("approve", started, &result);
        result
    }

    async fn approve_inner(&self, id: BookingId) -> Result<Booking, EngineError> {
        let mut tx = self
            .store
            .begin(Isolation::ReadCommitted, deadline_after(self.timeouts.approve()))
            .await?;
        let booking = tx
            .get_booking_for_update(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::NotPending {
                id,
                status: booking.status,
            });
        }
        if has_approved_conflict(
            &mut tx,
            booking.room_id,
            booking.span,
            Some(id),
            self.timeouts.conflict_check(),
        )
        .await?
        {
            info!(booking_id = %id, "approval refused: conflict");
            return Err(EngineError::ConflictDetected(Box::new(booking)));
        }

        let rows = tx
            .update_status(id, Some(BookingStatus::Pending), BookingStatus::Approved)
            .await?;
        if rows == 0 {
            return Err(EngineError::NotPending {
                id,
                status: booking.status,
            });
        }
        tx.commit().await?;
        info!(booking_id = %id, "booking approved");
        Ok(Booking {
            status: BookingStatus::Approved,
            ..booking
        })
    }

    /// Reject a pending booking with a single conditional update.
    ///
    /// Zero rows affected means the booking is unknown or no longer pending; a
    /// follow-up committed read tells the two apart.
    pub async fn reject(&self, id: BookingId) -> Result<(), EngineError> {
        let started = std::time::Instant::now();
        let result = self.reject_inner(id).await;
        observe("reject", started, &result);
        result
    }

    async fn reject_inner(&self, id: BookingId) -> Result<(), EngineError> {
        let rows = self
            .store
            .update_status_if(
                id,
                BookingStatus::Pending,
                BookingStatus::Rejected,
                deadline_after(self.timeouts.reject()),
            )
            .await?;
        if rows == 0 {
            return Err(match self.store.booking(id).await {
                Some(b) => EngineError::NotPending { id, status: b.status },
                None => EngineError::NotFound(id),
            });
        }
        info!(booking_id = %id, "booking rejected");
        Ok(())
    }

    /// Administrative override: approve `id` unconditionally, rejecting every
    /// other approved booking on the room that overlaps it, in one commit.
    pub async fn force_allocate(&self, id: BookingId) -> Result<Preemption, EngineError> {
        let started = std::time::Instant::now();
        let result = self.force_allocate_inner(id).await;
        observe("force_allocate", started, &result);
        result
    }

    async fn force_allocate_inner(&self, id: BookingId) -> Result<Preemption, EngineError> {
        let mut tx = self
            .store
            .begin(Isolation::ReadCommitted, deadline_after(self.timeouts.preempt()))
            .await?;
        let target = tx
            .get_booking_for_update(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        let displaced = tx
            .reject_overlapping(target.room_id, target.span, id)
            .await?;
        tx.update_status(id, None, BookingStatus::Approved).await?;
        tx.commit().await?;

        metrics::counter!(BOOKINGS_DISPLACED_TOTAL).increment(displaced.len() as u64);
        if displaced.is_empty() {
            info!(booking_id = %id, "booking force-allocated");
        } else {
            warn!(
                booking_id = %id,
                room_id = %target.room_id,
                displaced = displaced.len(),
                "booking force-allocated, displaced approved bookings"
            );
        }
        Ok(Preemption {
            booking: Booking {
                status: BookingStatus::Approved,
                ..target
            },
            displaced,
        })
    }
}

fn status_label(status: BookingStatus) -> &'static str {
    match status {
        BookingStatus::Pending => "pending",
        BookingStatus::Approved => "approved",
        BookingStatus::Rejected => "rejected",
    }
}
