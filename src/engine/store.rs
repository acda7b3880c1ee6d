use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{EngineError, RoomGuard};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Bounded retry for transient I/O failures at the store boundary.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued (the batch window).
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Record, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Record, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let result = wal.append_buffered(&record).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// Durable record of every room and booking.
///
/// Each room's state sits behind its own `RwLock`; the booking coordinator
/// takes the owned write half as the per-room critical section and hands it
/// to the mutating methods here. Mutations are appended to the WAL first and
/// applied in memory only once the append succeeded.
pub struct IntervalStore {
    rooms: DashMap<Ulid, SharedRoomState>,
    booking_to_room: DashMap<Ulid, Ulid>,
    /// Held by room creation and compaction so a compaction snapshot never
    /// misses a room whose creation is mid-append.
    registry: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    retry: StoreRetry,
}

impl IntervalStore {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: &Path, retry: StoreRetry) -> io::Result<Self> {
        let records = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            rooms: DashMap::new(),
            booking_to_room: DashMap::new(),
            registry: Mutex::new(()),
            wal_tx,
            retry,
        };
        for record in &records {
            store.replay_record(record)?;
        }
        debug!(records = records.len(), rooms = store.rooms.len(), "store replayed");
        Ok(store)
    }

    // We own every Arc during replay, so try_write never contends.
    fn replay_record(&self, record: &Record) -> io::Result<()> {
        let uncontended = |_| io::Error::other("replay: room state contended");
        match record {
            Record::RoomCreated { id, name, active } => {
                let room = Room { id: *id, name: name.clone(), active: *active };
                self.rooms.insert(*id, Arc::new(RwLock::new(RoomState::new(room))));
            }
            Record::BookingReplaced { replacement, room_id, .. } if replacement.room_id != *room_id => {
                let (Some(from), Some(to)) = (self.room(room_id), self.room(&replacement.room_id)) else {
                    return Ok(());
                };
                let mut from = from.try_write().map_err(uncontended)?;
                let mut to = to.try_write().map_err(uncontended)?;
                self.apply(&mut from, Some(&mut *to), record);
            }
            other => {
                if let Some(rs) = self.room(&record_room_id(other)) {
                    let mut guard = rs.try_write().map_err(uncontended)?;
                    self.apply(&mut guard, None, other);
                }
            }
        }
        Ok(())
    }

    /// Apply a durable record in memory. Caller holds the room lock(s);
    /// `to` is only set for a cross-room replacement.
    fn apply(&self, rs: &mut RoomState, to: Option<&mut RoomState>, record: &Record) {
        match record {
            Record::RoomActiveSet { active, .. } => rs.room.active = *active,
            Record::BookingInserted { booking } => {
                self.booking_to_room.insert(booking.id, booking.room_id);
                rs.insert_booking(booking.clone());
            }
            Record::BookingStatusSet { id, status, version, updated_at, .. } => {
                if let Some(b) = rs.booking_mut(id) {
                    b.status = *status;
                    b.version = *version;
                    b.updated_at = *updated_at;
                }
            }
            Record::BookingReplaced { id, version, updated_at, replacement, .. } => {
                if let Some(b) = rs.booking_mut(id) {
                    b.status = BookingStatus::Cancelled;
                    b.version = *version;
                    b.updated_at = *updated_at;
                }
                self.booking_to_room.insert(replacement.id, replacement.room_id);
                match to {
                    Some(target) => target.insert_booking(replacement.clone()),
                    None => rs.insert_booking(replacement.clone()),
                }
            }
            // Handled at the map level.
            Record::RoomCreated { .. } => {}
        }
    }

    async fn append_once(&self, record: &Record) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { record: record.clone(), response: tx })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer dropped response"))?
    }

    /// Append through the group-commit writer, retrying transient failures.
    async fn append(&self, record: &Record) -> Result<(), EngineError> {
        let mut attempt = 1;
        loop {
            match self.append_once(record).await {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) && attempt < self.retry.attempts => {
                    warn!(attempt, error = %e, "transient WAL failure, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(EngineError::WalError(e.to_string())),
            }
        }
    }

    /// Append `record`, then apply it to the guarded room(s).
    ///
    /// Both steps run on a spawned task that owns the guards, so dropping the
    /// caller's future cannot leave a durable record unapplied in memory. The
    /// rooms stay locked until the task finishes. Returns the `from` guard.
    async fn commit(
        self: &Arc<Self>,
        mut from: RoomGuard,
        mut to: Option<RoomGuard>,
        record: Record,
    ) -> Result<RoomGuard, EngineError> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            store.append(&record).await?;
            store.apply(&mut from, to.as_deref_mut(), &record);
            Ok::<_, EngineError>(from)
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    // ── Rooms ────────────────────────────────────────────────

    pub fn room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_ids(&self) -> Vec<Ulid> {
        self.rooms.iter().map(|e| *e.key()).collect()
    }

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// Register a room. Runs to completion on its own task once started.
    pub async fn create_room(self: &Arc<Self>, room: Room) -> Result<Room, EngineError> {
        let store = Arc::clone(self);
        tokio::spawn(async move { store.register_room(room).await })
            .await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    async fn register_room(&self, room: Room) -> Result<Room, EngineError> {
        let _registry = self.registry.lock().await;
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::DuplicateId(room.id));
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let record = Record::RoomCreated {
            id: room.id,
            name: room.name.clone(),
            active: room.active,
        };
        self.append(&record).await?;
        self.rooms
            .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        Ok(room)
    }

    /// Consumes the room guard; the room unlocks once the change is applied.
    pub async fn set_room_active(self: &Arc<Self>, guard: RoomGuard, active: bool) -> Result<Room, EngineError> {
        let record = Record::RoomActiveSet { id: guard.room.id, active };
        let guard = self.commit(guard, None, record).await?;
        Ok(guard.room.clone())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// PENDING and CONFIRMED bookings of the guarded room, sorted by start.
    pub fn list_active(rs: &RoomState) -> Vec<Booking> {
        rs.active().cloned().collect()
    }

    /// Fresh read of a room's active bookings.
    pub async fn list_active_for(&self, room_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let rs = self.room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(Self::list_active(&guard))
    }

    /// Persist a new booking. Does not check overlap: the caller must have run
    /// the availability check while holding the same room guard.
    pub async fn insert(self: &Arc<Self>, guard: RoomGuard, booking: Booking) -> Result<Booking, EngineError> {
        debug_assert_eq!(booking.room_id, guard.room.id);
        if self.booking_to_room.contains_key(&booking.id) {
            return Err(EngineError::DuplicateId(booking.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        let record = Record::BookingInserted { booking: booking.clone() };
        self.commit(guard, None, record).await?;
        Ok(booking)
    }

    fn expect_version(rs: &RoomState, id: Ulid, expected: u64) -> Result<&Booking, EngineError> {
        let current = rs.booking(&id).ok_or(EngineError::NotFound(id))?;
        if current.version != expected {
            return Err(EngineError::VersionMismatch {
                id,
                expected,
                actual: current.version,
            });
        }
        Ok(current)
    }

    /// Optimistic status write: fails with `VersionMismatch` if the stored
    /// version moved since the caller read it.
    pub async fn update_status(
        self: &Arc<Self>,
        guard: RoomGuard,
        id: Ulid,
        expected_version: u64,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        Self::expect_version(&guard, id, expected_version)?;
        let record = Record::BookingStatusSet {
            id,
            room_id: guard.room.id,
            status,
            version: expected_version + 1,
            updated_at: now_ms(),
        };
        let guard = self.commit(guard, None, record).await?;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Cancel and release the interval immediately.
    pub async fn cancel(self: &Arc<Self>, guard: RoomGuard, id: Ulid, expected_version: u64) -> Result<Booking, EngineError> {
        self.update_status(guard, id, expected_version, BookingStatus::Cancelled)
            .await
    }

    /// Cancel `id` in `from` and insert `replacement` (into `to`, or into
    /// `from` when the room is unchanged) as one WAL record.
    /// Returns `(cancelled, replacement)`.
    pub async fn replace(
        self: &Arc<Self>,
        from: RoomGuard,
        to: Option<RoomGuard>,
        id: Ulid,
        expected_version: u64,
        replacement: Booking,
    ) -> Result<(Booking, Booking), EngineError> {
        Self::expect_version(&from, id, expected_version)?;
        if self.booking_to_room.contains_key(&replacement.id) {
            return Err(EngineError::DuplicateId(replacement.id));
        }
        let target_len = to.as_ref().map_or(from.bookings.len(), |t| t.bookings.len());
        if target_len >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        let record = Record::BookingReplaced {
            id,
            room_id: from.room.id,
            version: expected_version + 1,
            updated_at: now_ms(),
            replacement: replacement.clone(),
        };
        let from = self.commit(from, to, record).await?;
        let cancelled = from.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        Ok((cancelled, replacement))
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the records needed to rebuild current state.
    ///
    /// Holds the registry lock and a read guard on every room (ascending id,
    /// the same order modify uses) so no append can be in flight.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut ids = self.room_ids();
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(rs) = self.room(id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut records = Vec::new();
        for guard in &guards {
            records.push(Record::RoomCreated {
                id: guard.room.id,
                name: guard.room.name.clone(),
                active: guard.room.active,
            });
            // TODO: drop terminal bookings older than a retention window once
            // lookups of archived bookings move out of the store.
            for booking in &guard.bookings {
                records.push(Record::BookingInserted { booking: booking.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The room a non-create record applies to.
fn record_room_id(record: &Record) -> Ulid {
    match record {
        Record::RoomCreated { id, .. } | Record::RoomActiveSet { id, .. } => *id,
        Record::BookingInserted { booking } => booking.room_id,
        Record::BookingStatusSet { room_id, .. } | Record::BookingReplaced { room_id, .. } => *room_id,
    }
}
