use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub type RoomId = Ulid;
pub type BookingId = Ulid;
pub type RequesterId = Ulid;

const HOUR_MS: f64 = 3_600_000.0;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from untrusted input, returning `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        self.duration_ms() as f64 / HOUR_MS
    }

    /// The one definition of "conflict": `s1 < e2 && s2 < e1`.
    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    #[default]
    Shared,
    Exclusive,
}

/// Operational state of a room. Informational only: allocation does not consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Online,
    Maintenance,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub capacity: u32,
    pub kind: RoomKind,
    pub status: RoomStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: RoomId,
    pub requester_id: RequesterId,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// A booking request before the store assigns it an id and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBooking {
    pub room_id: RoomId,
    pub requester_id: RequesterId,
    pub span: Span,
}

/// Committed state of one room: the room itself plus every booking on it.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// All bookings regardless of status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    pub fn id(&self) -> RoomId {
        self.room.id
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (any status) whose span overlaps the query window.
    /// Everything at index >= right_bound starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Approved bookings overlapping `query`, skipping `exclude`.
    pub fn approved_overlapping(
        &self,
        query: &Span,
        exclude: Option<BookingId>,
    ) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(move |b| {
            b.status == BookingStatus::Approved && Some(b.id) != exclude
        })
    }
}

/// One row-level change inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    BookingInserted {
        booking: Booking,
    },
    StatusChanged {
        id: BookingId,
        room_id: RoomId,
        from: BookingStatus,
        to: BookingStatus,
    },
}

impl Mutation {
    pub fn room_id(&self) -> RoomId {
        match self {
            Mutation::BookingInserted { booking } => booking.room_id,
            Mutation::StatusChanged { room_id, .. } => *room_id,
        }
    }
}

/// The WAL record format. A transaction is a single record, so a torn
/// write loses the whole transaction and never half of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        room: Room,
    },
    Committed {
        tx_id: Ulid,
        mutations: Vec<Mutation>,
    },
    BookingsReset {
        at: Ms,
    },
}

/// Approved usage of one room in the current calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyUsage {
    pub room_id: RoomId,
    pub room_name: String,
    pub approved_bookings: u64,
    pub total_hours: f64,
}

/// Dashboard counters. A point-in-time snapshot, not a transactional one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_bookings: u64,
    pub approved_bookings: u64,
    pub rejected_bookings: u64,
    pub pending_bookings: u64,
    pub total_rooms: u64,
    /// `approved / total_rooms` as a percentage, capped at 100.
    pub utilization: f64,
}

/// Result of a forced allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preemption {
    pub booking: Booking,
    pub displaced: Vec<BookingId>,
}
