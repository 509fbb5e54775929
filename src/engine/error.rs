use thiserror::Error;

use crate::model::{Booking, BookingId, BookingStatus, Ms};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval [{start}, {end}): {reason}")]
    InvalidInterval {
        start: Ms,
        end: Ms,
        reason: &'static str,
    },
    #[error("start {start} is more than the grace tolerance before now ({now})")]
    StaleRequest { start: Ms, now: Ms },
    /// A business outcome, not a defect. From `create` the booking is the
    /// committed rejected row; from `approve` it is the unchanged pending one.
    #[error("conflict with an approved booking on room {}", .0.room_id)]
    ConflictDetected(Box<Booking>),
    #[error("booking not found: {0}")]
    NotFound(BookingId),
    #[error("booking {id} is {status}, not pending")]
    NotPending { id: BookingId, status: BookingStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Status code the request-handling layer answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::InvalidInterval { .. } | EngineError::StaleRequest { .. } => 400,
            EngineError::NotFound(_) => 404,
            EngineError::ConflictDetected(_) | EngineError::NotPending { .. } => 409,
            EngineError::Store(_) => 500,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::StaleRequest { .. } => "stale_request",
            EngineError::ConflictDetected(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::NotPending { .. } => "not_pending",
            EngineError::Store(_) => "store_error",
        }
    }
}
