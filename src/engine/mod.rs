mod availability;
mod error;
mod mutations;
#[cfg(test)]
mod proptests;
mod queries;
mod store;

pub use availability::{check, first_conflict, validate_span};
pub use error::EngineError;
pub use store::{IntervalStore, SharedRoomState, StoreRetry};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OwnedRwLockWriteGuard;
use tracing::warn;
use ulid::Ulid;

use crate::model::RoomState;
use crate::notify::NotifyHub;
use crate::observability;

pub type RoomGuard = OwnedRwLockWriteGuard<RoomState>;

/// Tunables for the booking coordinator.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub wal_path: PathBuf,
    /// Upper bound on waiting for a room's critical section.
    pub lock_timeout: Duration,
    /// Attempts for an optimistic status change before `Contended`.
    pub status_retry_attempts: u32,
    /// Backoff between optimistic attempts, multiplied by the attempt number.
    pub retry_backoff: Duration,
    pub store_retry: StoreRetry,
}

impl EngineOptions {
    pub fn new(wal_path: PathBuf) -> Self {
        Self {
            wal_path,
            lock_timeout: Duration::from_secs(2),
            status_retry_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            store_retry: StoreRetry::default(),
        }
    }
}

/// The booking coordinator: the only entry point that mutates booking state.
///
/// Every mutation runs inside the target room's critical section (the room's
/// write lock from the store). The guard is handed to the store for the
/// commit, and events go to the hub after the lock is gone.
pub struct Engine {
    pub store: Arc<IntervalStore>,
    pub notify: Arc<NotifyHub>,
    lock_timeout: Duration,
    status_retry_attempts: u32,
    retry_backoff: Duration,
}

impl Engine {
    /// Replay the WAL and start the writer. Must be called inside a tokio runtime.
    pub fn new(options: EngineOptions, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let store = Arc::new(IntervalStore::open(&options.wal_path, options.store_retry)?);
        Ok(Self {
            store,
            notify,
            lock_timeout: options.lock_timeout,
            status_retry_attempts: options.status_retry_attempts,
            retry_backoff: options.retry_backoff,
        })
    }

    /// Enter a room's critical section, waiting at most `lock_timeout`.
    /// The guard releases on drop, so every exit path (including a dropped
    /// caller future) leaves the room unlocked.
    pub(super) async fn lock_room(&self, room_id: Ulid) -> Result<RoomGuard, EngineError> {
        let rs = self
            .store
            .room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let started = Instant::now();
        let guard = tokio::time::timeout(self.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| {
                warn!(room = %room_id, timeout_ms = self.lock_timeout.as_millis() as u64, "room lock timed out");
                metrics::counter!(observability::ROOM_LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::LockTimeout(room_id)
            })?;
        metrics::histogram!(observability::ROOM_LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(guard)
    }

    /// Lock one or two rooms in ascending id order. Returns `(a, b)` with
    /// `b` empty when both ids name the same room.
    pub(super) async fn lock_pair(&self, a: Ulid, b: Ulid) -> Result<(RoomGuard, Option<RoomGuard>), EngineError> {
        if a == b {
            return Ok((self.lock_room(a).await?, None));
        }
        if a < b {
            let ga = self.lock_room(a).await?;
            let gb = self.lock_room(b).await?;
            Ok((ga, Some(gb)))
        } else {
            let gb = self.lock_room(b).await?;
            let ga = self.lock_room(a).await?;
            Ok((ga, Some(gb)))
        }
    }

    /// Backoff before optimistic attempt `attempt + 1`.
    pub(super) async fn backoff(&self, attempt: u32) {
        metrics::counter!(observability::VERSION_RETRIES_TOTAL).increment(1);
        tokio::time::sleep(self.retry_backoff * attempt).await;
    }
}
