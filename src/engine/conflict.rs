use std::time::Duration;

use crate::limits::*;
use crate::model::*;
use crate::store::{StoreError, Transaction};

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Turn raw endpoints into a span, enforcing `start < end` and the accepted range.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let invalid = |reason| EngineError::InvalidInterval { start, end, reason };
    let span = Span::checked(start, end).ok_or_else(|| invalid("start must be before end"))?;
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(invalid("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(invalid("span too wide"));
    }
    Ok(span)
}

/// Reject starts further in the past than the grace tolerance.
pub(crate) fn check_not_stale(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start < now - GRACE_TOLERANCE_MS {
        return Err(EngineError::StaleRequest {
            start: span.start,
            now,
        });
    }
    Ok(())
}

/// Whether an approved booking on `room_id` (other than `exclude`) overlaps
/// `span`, as seen from inside `tx`. No conflict is `Ok(false)`, not an error.
pub async fn has_approved_conflict<T: Transaction>(
    tx: &mut T,
    room_id: RoomId,
    span: Span,
    exclude: Option<BookingId>,
    budget: Duration,
) -> Result<bool, EngineError> {
    let found = tokio::time::timeout(budget, tx.find_overlapping_approved(room_id, span, exclude))
        .await
        .map_err(|_| StoreError::DeadlineExceeded)??;
    Ok(found)
}
