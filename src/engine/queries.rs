use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, IntervalStore};

impl Engine {
    /// Fresh snapshot of one booking.
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self
            .store
            .room_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .store
            .room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        let rs = self.store.room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.room.clone())
    }

    /// Rooms sorted by id.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut ids = self.store.room_ids();
        ids.sort();
        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.store.room(&id) {
                rooms.push(rs.read().await.room.clone());
            }
        }
        rooms
    }

    /// PENDING and CONFIRMED bookings of a room, sorted by start.
    pub async fn list_active(&self, room_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.store.list_active_for(room_id).await
    }

    /// Every booking of a room regardless of status, sorted by start.
    pub async fn list_bookings(&self, room_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .store
            .room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.bookings.clone())
    }

    /// PENDING bookings created at or before `now - ttl`. Rooms whose lock is
    /// busy are skipped; the next sweep picks them up.
    pub fn stale_pending(&self, now: Ms, ttl: Ms) -> Vec<Ulid> {
        let cutoff = now.saturating_sub(ttl);
        let mut stale = Vec::new();
        for room_id in self.store.room_ids() {
            let Some(rs) = self.store.room(&room_id) else { continue };
            if let Ok(guard) = rs.try_read() {
                stale.extend(
                    IntervalStore::list_active(&guard)
                        .into_iter()
                        .filter(|b| b.status == BookingStatus::Pending && b.created_at <= cutoff)
                        .map(|b| b.id),
                );
            }
        }
        stale
    }
}
