//! Conflict-free allocation of rooms to time-bound bookings.
//!
//! The [`engine::BookingEngine`] decides every booking inside a transaction of
//! the [`store::AllocationStore`] under an exclusive per-room lock, so no two
//! approved bookings on one room ever overlap.

pub mod config;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;
