mod conflict;
mod error;
mod lifecycle;
mod usage;

pub use conflict::{has_approved_conflict, now_ms};
pub use error::EngineError;
pub use usage::month_bounds;

use std::time::Duration;

use tokio::time::Instant;

use crate::config::Timeouts;
use crate::observability::{LIFECYCLE_OPS_TOTAL, LIFECYCLE_OP_DURATION_SECONDS};
use crate::store::{AllocationStore, Store};

/// The booking lifecycle engine. Holds no shared mutable state of its own:
/// every decision is made inside a store transaction under the room's lock,
/// so any number of engines may share one store.
pub struct BookingEngine<S: AllocationStore = Store> {
    store: S,
    timeouts: Timeouts,
}

impl<S: AllocationStore> BookingEngine<S> {
    pub fn new(store: S, timeouts: Timeouts) -> Self {
        Self { store, timeouts }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }
}

fn deadline_after(budget: Duration) -> Instant {
    Instant::now() + budget
}

/// Record outcome and latency of one lifecycle operation.
fn observe<T>(op: &'static str, started: std::time::Instant, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(LIFECYCLE_OPS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(LIFECYCLE_OP_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
