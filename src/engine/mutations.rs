use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Event;
use crate::observability;

use super::availability::{check, validate_span};
use super::{Engine, EngineError};

/// Reject a transition the booking state machine does not allow.
fn check_transition(booking: &Booking, to: BookingStatus) -> Result<(), EngineError> {
    if booking.status == BookingStatus::Cancelled && to == BookingStatus::Cancelled {
        return Err(EngineError::AlreadyCancelled(booking.id));
    }
    if !booking.status.can_transition_to(to) {
        return Err(EngineError::InvalidTransition {
            id: booking.id,
            from: booking.status,
            to,
        });
    }
    Ok(())
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, id: Ulid, name: Option<String>) -> Result<Room, EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("room name too long"));
            }
        let room = self.store.create_room(Room { id, name, active: true }).await?;
        info!(room = %id, "room created");
        Ok(room)
    }

    /// Open or close a room for new bookings. Existing bookings are kept.
    pub async fn set_room_active(&self, id: Ulid, active: bool) -> Result<Room, EngineError> {
        let guard = self.lock_room(id).await?;
        if guard.room.active == active {
            return Ok(guard.room.clone());
        }
        let room = self.store.set_room_active(guard, active).await?;

        info!(room = %id, active, "room status changed");
        self.notify.publish(Event::RoomStatusChanged(room.clone()));
        Ok(room)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Grant `span` in `room_id` to `pet_id` if nothing active overlaps it.
    /// The new booking starts PENDING at version 0.
    pub async fn create_booking(&self, room_id: Ulid, pet_id: Ulid, span: Span) -> Result<Booking, EngineError> {
        validate_span(&span)?;
        let rs = self
            .store
            .room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        // Fast fail without queueing on the lock; re-checked inside.
        if let Ok(guard) = rs.try_read()
            && !guard.room.active {
                return Err(EngineError::RoomInactive(room_id));
            }

        let guard = self.lock_room(room_id).await?;
        if !guard.room.active {
            return Err(EngineError::RoomInactive(room_id));
        }
        if let Err(e) = check(&guard, &span, None) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!(room = %room_id, error = %e, "booking rejected");
            return Err(e);
        }
        let booking = Booking::pending(Ulid::new(), room_id, pet_id, span, now_ms());
        // The store releases the room once the booking is durable and applied.
        let booking = self.store.insert(guard, booking).await?;

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(booking = %booking.id, room = %room_id, pet = %pet_id, "booking created");
        self.notify.publish(Event::BookingCreated(booking.clone()));
        Ok(booking)
    }

    /// Cancel and release the interval.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.transition(id, None, BookingStatus::Cancelled).await?;
        info!(booking = %id, room = %booking.room_id, "booking cancelled");
        self.notify.publish(Event::BookingCancelled(booking.clone()));
        Ok(booking)
    }

    /// Cancel only if the booking is still PENDING. Used for unconfirmed expiry.
    pub async fn expire_pending(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self
            .transition(id, Some(BookingStatus::Pending), BookingStatus::Cancelled)
            .await?;
        info!(booking = %id, room = %booking.room_id, "pending booking expired");
        self.notify.publish(Event::BookingCancelled(booking.clone()));
        Ok(booking)
    }

    /// PENDING → CONFIRMED (payment or check-in).
    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.transition(id, None, BookingStatus::Confirmed).await?;
        self.notify.publish(Event::BookingStatusChanged(booking.clone()));
        Ok(booking)
    }

    /// CONFIRMED → COMPLETED (checkout).
    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.transition(id, None, BookingStatus::Completed).await?;
        self.notify.publish(Event::BookingStatusChanged(booking.clone()));
        Ok(booking)
    }

    /// Optimistic status change: read a snapshot without the lock, then write
    /// under the room lock against the snapshot's version. A moved version
    /// re-reads and retries, up to `status_retry_attempts`.
    async fn transition(
        &self,
        id: Ulid,
        require: Option<BookingStatus>,
        to: BookingStatus,
    ) -> Result<Booking, EngineError> {
        for attempt in 1..=self.status_retry_attempts {
            let snapshot = self.get_booking(id).await?;
            if let Some(required) = require
                && snapshot.status != required {
                    return Err(EngineError::InvalidTransition { id, from: snapshot.status, to });
                }
            check_transition(&snapshot, to)?;

            let guard = self.lock_room(snapshot.room_id).await?;
            let result = match to {
                BookingStatus::Cancelled => self.store.cancel(guard, id, snapshot.version).await,
                _ => self.store.update_status(guard, id, snapshot.version, to).await,
            };
            match result {
                Ok(booking) => {
                    metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "status" => to.as_str())
                        .increment(1);
                    return Ok(booking);
                }
                Err(EngineError::VersionMismatch { expected, actual, .. }) => {
                    debug!(booking = %id, attempt, expected, actual, "version moved, retrying");
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(booking = %id, attempts = self.status_retry_attempts, "status change contended");
        Err(EngineError::Contended(id))
    }

    /// Move a booking to `span`, optionally in another room.
    ///
    /// Cancel-then-create inside one critical section covering both rooms
    /// (locked in ascending id order). The replacement gets a fresh id and
    /// keeps the pet and status. If the re-check fails, nothing changes.
    pub async fn modify_booking(
        &self,
        id: Ulid,
        new_room_id: Option<Ulid>,
        span: Span,
    ) -> Result<Booking, EngineError> {
        validate_span(&span)?;
        for attempt in 1..=self.status_retry_attempts {
            let snapshot = self.get_booking(id).await?;
            check_transition(&snapshot, BookingStatus::Cancelled)?;
            let target = new_room_id.unwrap_or(snapshot.room_id);

            let (from, to) = self.lock_pair(snapshot.room_id, target).await?;
            let target_state: &RoomState = to.as_deref().unwrap_or(&*from);
            if !target_state.room.active {
                return Err(EngineError::RoomInactive(target));
            }
            if let Err(e) = check(target_state, &span, Some(id)) {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                debug!(booking = %id, room = %target, error = %e, "modification rejected");
                return Err(e);
            }

            let mut replacement = Booking::pending(Ulid::new(), target, snapshot.pet_id, span, now_ms());
            replacement.status = snapshot.status;

            match self
                .store
                .replace(from, to, id, snapshot.version, replacement)
                .await
            {
                Ok((cancelled, replacement)) => {
                    metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                    info!(booking = %id, replacement = %replacement.id, room = %target, "booking modified");
                    self.notify.publish(Event::BookingCancelled(cancelled));
                    self.notify.publish(Event::BookingCreated(replacement.clone()));
                    return Ok(replacement);
                }
                Err(EngineError::VersionMismatch { expected, actual, .. }) => {
                    debug!(booking = %id, attempt, expected, actual, "version moved, retrying modify");
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(booking = %id, attempts = self.status_retry_attempts, "modification contended");
        Err(EngineError::Contended(id))
    }
}
