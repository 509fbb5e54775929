use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_ROOM;
use crate::model::*;
use crate::observability::{ROOM_LOCK_WAIT_SECONDS, TX_TOTAL};

use super::{Isolation, StoreError, StoreInner, Transaction};

enum Undo {
    Inserted { room_id: RoomId, id: BookingId },
    Status { room_id: RoomId, id: BookingId, prev: BookingStatus },
}

/// A transaction against [`Store`](super::Store).
///
/// Writes go straight into the locked room state and are recorded twice: as
/// WAL mutations for commit and as undo entries for rollback. Nobody outside
/// the transaction can observe them because every other reader needs the
/// room's lock.
pub struct StoreTx {
    inner: Arc<StoreInner>,
    id: Ulid,
    isolation: Isolation,
    deadline: Instant,
    locked: HashMap<RoomId, OwnedRwLockWriteGuard<RoomState>>,
    /// Bookings inserted by this transaction, not yet in the shared index.
    inserted: HashMap<BookingId, RoomId>,
    mutations: Vec<Mutation>,
    undo: Vec<Undo>,
    /// Writer's answer for a commit record already handed over.
    pending: Option<oneshot::Receiver<io::Result<()>>>,
    finished: bool,
}

impl StoreTx {
    pub(super) fn new(inner: Arc<StoreInner>, isolation: Isolation, deadline: Instant) -> Self {
        Self {
            inner,
            id: Ulid::new(),
            isolation,
            deadline,
            locked: HashMap::new(),
            inserted: HashMap::new(),
            mutations: Vec::new(),
            undo: Vec::new(),
            pending: None,
            finished: false,
        }
    }

    /// Move the open state into a fresh transaction, leaving `self` finished.
    fn detach(&mut self) -> StoreTx {
        self.finished = true;
        StoreTx {
            inner: self.inner.clone(),
            id: self.id,
            isolation: self.isolation,
            deadline: self.deadline,
            locked: std::mem::take(&mut self.locked),
            inserted: std::mem::take(&mut self.inserted),
            mutations: std::mem::take(&mut self.mutations),
            undo: std::mem::take(&mut self.undo),
            pending: None,
            finished: false,
        }
    }

    /// Finish a commit whose caller went away, still holding the room locks.
    async fn settle(mut self, mut rx: oneshot::Receiver<io::Result<()>>) {
        match StoreInner::wal_wait(&mut rx).await {
            Ok(()) => {
                self.publish_inserted();
                self.release("committed");
            }
            Err(e) => {
                warn!(tx_id = %self.id, "abandoned commit failed, rolling back: {e}");
                self.rollback();
            }
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TxFinished);
        }
        Ok(())
    }

    /// Exclusive access to a room, acquiring its lock on first use.
    async fn room_mut(&mut self, room_id: RoomId) -> Result<&mut RoomState, StoreError> {
        let guard = match self.locked.entry(room_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let shared = self
                    .inner
                    .room(&room_id)
                    .ok_or(StoreError::UnknownRoom(room_id))?;
                let started = std::time::Instant::now();
                let guard = tokio::time::timeout_at(self.deadline, shared.write_owned())
                    .await
                    .map_err(|_| StoreError::DeadlineExceeded)?;
                metrics::histogram!(ROOM_LOCK_WAIT_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                v.insert(guard)
            }
        };
        Ok(&mut **guard)
    }

    fn room_of(&self, id: BookingId) -> Option<RoomId> {
        self.inserted
            .get(&id)
            .copied()
            .or_else(|| self.inner.booking_index.get(&id).map(|e| *e.value()))
    }

    fn set_status(&mut self, room_id: RoomId, id: BookingId, prev: BookingStatus, to: BookingStatus) {
        if let Some(rs) = self.locked.get_mut(&room_id)
            && let Some(b) = rs.booking_mut(id)
        {
            b.status = to;
            self.undo.push(Undo::Status { room_id, id, prev });
            self.mutations.push(Mutation::StatusChanged {
                id,
                room_id,
                from: prev,
                to,
            });
        }
    }

    fn publish_inserted(&mut self) {
        for (id, room_id) in self.inserted.drain() {
            self.inner.booking_index.insert(id, room_id);
        }
    }

    fn release(&mut self, outcome: &'static str) {
        self.locked.clear();
        self.inserted.clear();
        self.mutations.clear();
        self.undo.clear();
        self.finished = true;
        metrics::counter!(TX_TOTAL, "outcome" => outcome).increment(1);
    }
}

#[async_trait]
impl Transaction for StoreTx {
    async fn lock_room_for_update(&mut self, room_id: RoomId) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.room_mut(room_id).await?;
        Ok(())
    }

    async fn find_overlapping_approved(
        &mut self,
        room_id: RoomId,
        span: Span,
        exclude: Option<BookingId>,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        if self.isolation == Isolation::Serializable || self.locked.contains_key(&room_id) {
            let rs = self.room_mut(room_id).await?;
            return Ok(rs.approved_overlapping(&span, exclude).next().is_some());
        }
        let shared = self
            .inner
            .room(&room_id)
            .ok_or(StoreError::UnknownRoom(room_id))?;
        let rs = tokio::time::timeout_at(self.deadline, shared.read())
            .await
            .map_err(|_| StoreError::DeadlineExceeded)?;
        Ok(rs.approved_overlapping(&span, exclude).next().is_some())
    }

    async fn insert_booking(
        &mut self,
        new: NewBooking,
        status: BookingStatus,
    ) -> Result<Booking, StoreError> {
        self.ensure_open()?;
        let rs = self.room_mut(new.room_id).await?;
        if rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(StoreError::LimitExceeded("too many bookings on room"));
        }
        let booking = Booking {
            id: Ulid::new(),
            room_id: new.room_id,
            requester_id: new.requester_id,
            span: new.span,
            status,
            created_at: crate::engine::now_ms(),
        };
        rs.insert_booking(booking.clone());
        self.inserted.insert(booking.id, booking.room_id);
        self.undo.push(Undo::Inserted {
            room_id: booking.room_id,
            id: booking.id,
        });
        self.mutations.push(Mutation::BookingInserted {
            booking: booking.clone(),
        });
        Ok(booking)
    }

    async fn get_booking_for_update(&mut self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        self.ensure_open()?;
        let Some(room_id) = self.room_of(id) else {
            return Ok(None);
        };
        let rs = self.room_mut(room_id).await?;
        Ok(rs.booking(id).cloned())
    }

    async fn update_status(
        &mut self,
        id: BookingId,
        from: Option<BookingStatus>,
        to: BookingStatus,
    ) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let Some(room_id) = self.room_of(id) else {
            return Ok(0);
        };
        let rs = self.room_mut(room_id).await?;
        let Some(prev) = rs.booking(id).map(|b| b.status) else {
            return Ok(0);
        };
        if from.is_some_and(|f| f != prev) {
            return Ok(0);
        }
        self.set_status(room_id, id, prev, to);
        Ok(1)
    }

    async fn reject_overlapping(
        &mut self,
        room_id: RoomId,
        span: Span,
        exclude: BookingId,
    ) -> Result<Vec<BookingId>, StoreError> {
        self.ensure_open()?;
        let rs = self.room_mut(room_id).await?;
        let hits: Vec<BookingId> = rs
            .approved_overlapping(&span, Some(exclude))
            .map(|b| b.id)
            .collect();
        for id in &hits {
            self.set_status(room_id, *id, BookingStatus::Approved, BookingStatus::Rejected);
        }
        Ok(hits)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.mutations.is_empty() {
            self.release("committed");
            return Ok(());
        }
        if Instant::now() >= self.deadline {
            self.rollback();
            return Err(StoreError::DeadlineExceeded);
        }

        let event = Event::Committed {
            tx_id: self.id,
            mutations: self.mutations.clone(),
        };
        let rx = match self.inner.wal_send(event).await {
            Ok(rx) => rx,
            Err(e) => {
                self.rollback();
                return Err(e);
            }
        };
        // The record is queued for disk. If this future is dropped before the
        // writer answers, Drop hands the receiver to `settle`.
        let durable = StoreInner::wal_wait(self.pending.insert(rx)).await;
        self.pending = None;
        if let Err(e) = durable {
            self.rollback();
            return Err(e);
        }

        self.publish_inserted();
        debug!(tx_id = %self.id, mutations = self.mutations.len(), "transaction committed");
        self.release("committed");
        Ok(())
    }

    fn rollback(&mut self) {
        if self.finished {
            return;
        }
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Inserted { room_id, id } => {
                    if let Some(rs) = self.locked.get_mut(&room_id) {
                        rs.remove_booking(id);
                    }
                }
                Undo::Status { room_id, id, prev } => {
                    if let Some(rs) = self.locked.get_mut(&room_id)
                        && let Some(b) = rs.booking_mut(id)
                    {
                        b.status = prev;
                    }
                }
            }
        }
        if !self.mutations.is_empty() {
            debug!(tx_id = %self.id, "transaction rolled back");
        }
        self.release("rolled_back");
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(rx) = self.pending.take() else {
            self.rollback();
            return;
        };
        // Cancelled mid-commit: the outcome is up to the writer, so keep the
        // locks until it answers.
        let mut orphan = self.detach();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(orphan.settle(rx));
            }
            Err(_) => {
                warn!(tx_id = %orphan.id, "commit abandoned outside a runtime, keeping writes");
                orphan.publish_inserted();
                orphan.release("committed");
            }
        }
    }
}
