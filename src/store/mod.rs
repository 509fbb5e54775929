//! The allocation store: durable, transactional owner of rooms and bookings.
//!
//! Every room is an `Arc<RwLock<RoomState>>`. Holding a room's write lock is
//! the "row lock" of the transaction contract: it serialises every
//! create/approve/preempt against that room while other rooms proceed in
//! parallel. Writes are applied in place under the lock with an undo log and
//! become durable as one WAL record on commit.

mod error;
mod tx;
mod writer;

pub use error::StoreError;
pub use tx::StoreTx;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use writer::{wal_writer_loop, WalCommand};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Requested isolation for a transaction.
///
/// `ReadCommitted` reads an unlocked room through its read lock and so only
/// ever sees committed state. `Serializable` locks every room it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    ReadCommitted,
    Serializable,
}

/// The store side of the transaction contract used by the lifecycle engine.
#[async_trait]
pub trait AllocationStore: Send + Sync + 'static {
    type Tx: Transaction;

    async fn begin(&self, isolation: Isolation, deadline: Instant) -> Result<Self::Tx, StoreError>;

    /// Autocommit conditional update: `SET status = to WHERE id = ? AND status = from`.
    async fn update_status_if(
        &self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
        deadline: Instant,
    ) -> Result<u64, StoreError>;

    /// Committed view of one booking.
    async fn booking(&self, id: BookingId) -> Option<Booking>;

    /// Committed view of every room, one room at a time.
    async fn scan(&self, deadline: Instant) -> Result<Vec<RoomState>, StoreError>;
}

/// One open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// `SELECT ... FOR UPDATE` on the room.
    async fn lock_room_for_update(&mut self, room_id: RoomId) -> Result<(), StoreError>;

    /// Whether any approved booking on `room_id` other than `exclude` overlaps `span`.
    /// Sees this transaction's own uncommitted writes.
    async fn find_overlapping_approved(
        &mut self,
        room_id: RoomId,
        span: Span,
        exclude: Option<BookingId>,
    ) -> Result<bool, StoreError>;

    async fn insert_booking(
        &mut self,
        new: NewBooking,
        status: BookingStatus,
    ) -> Result<Booking, StoreError>;

    /// Lock the booking's room and return the booking, or `None` if unknown.
    async fn get_booking_for_update(&mut self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Set `to`, only if the current status equals `from` when given. Returns rows affected.
    async fn update_status(
        &mut self,
        id: BookingId,
        from: Option<BookingStatus>,
        to: BookingStatus,
    ) -> Result<u64, StoreError>;

    /// Reject every approved booking on the room overlapping `span`, except `exclude`.
    /// Returns the ids that changed; its length is the rows affected.
    async fn reject_overlapping(
        &mut self,
        room_id: RoomId,
        span: Span,
        exclude: BookingId,
    ) -> Result<Vec<BookingId>, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Undo every uncommitted write and release all locks. Idempotent;
    /// a no-op after commit.
    fn rollback(&mut self);
}

pub(crate) struct StoreInner {
    pub(crate) rooms: DashMap<RoomId, SharedRoomState>,
    /// Reverse lookup: booking id → room id. Only committed bookings appear here.
    pub(crate) booking_index: DashMap<BookingId, RoomId>,
    pub(crate) wal_tx: mpsc::Sender<WalCommand>,
    /// Serialises catalog-wide operations (room registration, reset, compaction).
    catalog: Mutex<()>,
    path: PathBuf,
}

impl StoreInner {
    pub(crate) fn room(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Hand an event to the group-commit writer and wait until it is durable.
    pub(crate) async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let mut rx = self.wal_send(event).await?;
        Self::wal_wait(&mut rx).await
    }

    pub(crate) async fn wal_send(
        &self,
        event: Event,
    ) -> Result<oneshot::Receiver<io::Result<()>>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        Ok(rx)
    }

    pub(crate) async fn wal_wait(
        rx: &mut oneshot::Receiver<io::Result<()>>,
    ) -> Result<(), StoreError> {
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(StoreError::from)
    }
}

/// Apply a committed mutation to a room (caller holds the lock).
pub(crate) fn apply_mutation(rs: &mut RoomState, mutation: &Mutation) {
    match mutation {
        Mutation::BookingInserted { booking } => rs.insert_booking(booking.clone()),
        Mutation::StatusChanged { id, to, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = *to;
            }
        }
    }
}

/// WAL-backed in-memory allocation store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Replay the WAL at `path`, cut off any torn tail, and start the
    /// group-commit writer. Must be called from within a Tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::recover(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = StoreInner {
            rooms: DashMap::new(),
            booking_index: DashMap::new(),
            wal_tx,
            catalog: Mutex::new(()),
            path: path.to_path_buf(),
        };
        let replayed = events.len();
        for event in events {
            replay_event(&inner, event);
        }
        info!(
            "store opened at {} ({replayed} events, {} rooms, {} bookings)",
            path.display(),
            inner.rooms.len(),
            inner.booking_index.len()
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub async fn room(&self, id: RoomId) -> Option<Room> {
        let shared = self.inner.room(&id)?;
        let guard = shared.read().await;
        Some(guard.room.clone())
    }

    /// Make a room known to the store so bookings can lock it.
    pub async fn register_room(
        &self,
        name: String,
        capacity: u32,
        kind: RoomKind,
        status: RoomStatus,
    ) -> Result<Room, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidRoom("name must not be empty"));
        }
        if name.len() > MAX_ROOM_NAME_LEN {
            return Err(StoreError::LimitExceeded("room name too long"));
        }
        if capacity == 0 {
            return Err(StoreError::InvalidRoom("capacity must be positive"));
        }
        let _catalog = self.inner.catalog.lock().await;
        if self.inner.rooms.len() >= MAX_ROOMS {
            return Err(StoreError::LimitExceeded("too many rooms"));
        }

        let room = Room {
            id: Ulid::new(),
            name,
            capacity,
            kind,
            status,
            created_at: crate::engine::now_ms(),
        };
        self.inner
            .wal_append(Event::RoomRegistered { room: room.clone() })
            .await?;
        self.inner
            .rooms
            .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        info!(room_id = %room.id, name = %room.name, "room registered");
        Ok(room)
    }

    /// Administrative bulk delete of every booking. Rooms are kept.
    /// Returns the number of bookings removed.
    pub async fn reset_bookings(&self) -> Result<u64, StoreError> {
        let _catalog = self.inner.catalog.lock().await;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut room_ids: Vec<RoomId> = self.inner.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort();
        let mut guards = Vec::with_capacity(room_ids.len());
        for id in &room_ids {
            if let Some(shared) = self.inner.room(id) {
                guards.push(shared.write_owned().await);
            }
        }

        self.inner
            .wal_append(Event::BookingsReset {
                at: crate::engine::now_ms(),
            })
            .await?;

        let mut removed = 0u64;
        for guard in &mut guards {
            removed += guard.bookings.len() as u64;
            guard.bookings.clear();
        }
        self.inner.booking_index.clear();
        info!("reset removed {removed} bookings");
        Ok(removed)
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _catalog = self.inner.catalog.lock().await;

        // Read locks on every room for the whole rewrite, so no commit can
        // land in the old log after the snapshot was taken.
        let mut room_ids: Vec<RoomId> = self.inner.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort();
        let mut guards = Vec::with_capacity(room_ids.len());
        for id in &room_ids {
            if let Some(shared) = self.inner.room(id) {
                guards.push(shared.read_owned().await);
            }
        }

        let mut events = Vec::with_capacity(guards.len() * 2);
        for guard in &guards {
            events.push(Event::RoomRegistered {
                room: guard.room.clone(),
            });
            if !guard.bookings.is_empty() {
                events.push(Event::Committed {
                    tx_id: Ulid::new(),
                    mutations: guard
                        .bookings
                        .iter()
                        .map(|b| Mutation::BookingInserted { booking: b.clone() })
                        .collect(),
                });
            }
        }
        let count = events.len();

        let (tx, mut rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        StoreInner::wal_wait(&mut rx).await?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
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

fn replay_event(inner: &StoreInner, event: Event) {
    // Replay runs before the store is shared, so try_write never contends.
    match event {
        Event::RoomRegistered { room } => {
            inner
                .rooms
                .insert(room.id, Arc::new(RwLock::new(RoomState::new(room))));
        }
        Event::Committed { mutations, .. } => {
            for mutation in &mutations {
                let Some(shared) = inner.room(&mutation.room_id()) else {
                    continue;
                };
                let Ok(mut guard) = shared.try_write() else {
                    continue;
                };
                apply_mutation(&mut guard, mutation);
                if let Mutation::BookingInserted { booking } = mutation {
                    inner.booking_index.insert(booking.id, booking.room_id);
                }
            }
        }
        Event::BookingsReset { .. } => {
            for entry in inner.rooms.iter() {
                if let Ok(mut guard) = entry.value().try_write() {
                    guard.bookings.clear();
                }
            }
            inner.booking_index.clear();
        }
    }
}

#[async_trait]
impl AllocationStore for Store {
    type Tx = StoreTx;

    async fn begin(&self, isolation: Isolation, deadline: Instant) -> Result<StoreTx, StoreError> {
        Ok(StoreTx::new(self.inner.clone(), isolation, deadline))
    }

    async fn update_status_if(
        &self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
        deadline: Instant,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin(Isolation::ReadCommitted, deadline).await?;
        let rows = tx.update_status(id, Some(from), to).await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn booking(&self, id: BookingId) -> Option<Booking> {
        let room_id = self.inner.booking_index.get(&id).map(|e| *e.value())?;
        let shared = self.inner.room(&room_id)?;
        let guard = shared.read().await;
        guard.booking(id).cloned()
    }

    async fn scan(&self, deadline: Instant) -> Result<Vec<RoomState>, StoreError> {
        let rooms: Vec<SharedRoomState> =
            self.inner.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(rooms.len());
        for shared in rooms {
            let guard = tokio::time::timeout_at(deadline, shared.read())
                .await
                .map_err(|_| StoreError::DeadlineExceeded)?;
            out.push(guard.clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests;
