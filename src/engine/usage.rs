use std::cmp::Ordering;

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use crate::model::*;
use crate::store::AllocationStore;

use super::{deadline_after, BookingEngine, EngineError};

/// `[first instant of the month, first instant of the next month)` in Unix ms.
pub fn month_bounds(now: DateTime<Utc>) -> Option<Span> {
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let start = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.and_hms_opt(0, 0, 0)?;
    Span::checked(
        start.and_utc().timestamp_millis(),
        end.and_utc().timestamp_millis(),
    )
}

/// Approved usage per room for bookings starting inside `month`, heaviest first.
pub(crate) fn aggregate_monthly(rooms: &[RoomState], month: &Span) -> Vec<MonthlyUsage> {
    let mut report: Vec<MonthlyUsage> = rooms
        .iter()
        .filter_map(|rs| {
            let (count, hours) = rs
                .bookings
                .iter()
                .filter(|b| {
                    b.status == BookingStatus::Approved && month.contains_instant(b.span.start)
                })
                .fold((0u64, 0.0f64), |(n, h), b| (n + 1, h + b.span.hours()));
            (count > 0).then(|| MonthlyUsage {
                room_id: rs.room.id,
                room_name: rs.room.name.clone(),
                approved_bookings: count,
                total_hours: hours,
            })
        })
        .collect();
    report.sort_by(|a, b| {
        b.total_hours
            .partial_cmp(&a.total_hours)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.room_name.cmp(&b.room_name))
    });
    report
}

pub(crate) fn aggregate_stats(rooms: &[RoomState]) -> SystemStats {
    let mut stats = SystemStats {
        total_bookings: 0,
        approved_bookings: 0,
        rejected_bookings: 0,
        pending_bookings: 0,
        total_rooms: rooms.len() as u64,
        utilization: 0.0,
    };
    for b in rooms.iter().flat_map(|rs| rs.bookings.iter()) {
        stats.total_bookings += 1;
        match b.status {
            BookingStatus::Approved => stats.approved_bookings += 1,
            BookingStatus::Rejected => stats.rejected_bookings += 1,
            BookingStatus::Pending => stats.pending_bookings += 1,
        }
    }
    if stats.total_rooms > 0 {
        let ratio = stats.approved_bookings as f64 / stats.total_rooms as f64 * 100.0;
        stats.utilization = ratio.min(100.0);
    }
    stats
}

impl<S: AllocationStore> BookingEngine<S> {
    async fn snapshot(&self) -> Result<Vec<RoomState>, EngineError> {
        Ok(self
            .store
            .scan(deadline_after(self.timeouts.report()))
            .await?)
    }

    /// Approved bookings per room in the current UTC calendar month.
    pub async fn monthly_usage(&self) -> Result<Vec<MonthlyUsage>, EngineError> {
        self.monthly_usage_at(Utc::now()).await
    }

    pub async fn monthly_usage_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MonthlyUsage>, EngineError> {
        let Some(month) = month_bounds(now) else {
            return Ok(Vec::new());
        };
        let rooms = self.snapshot().await?;
        Ok(aggregate_monthly(&rooms, &month))
    }

    pub async fn system_stats(&self) -> Result<SystemStats, EngineError> {
        let rooms = self.snapshot().await?;
        Ok(aggregate_stats(&rooms))
    }

    /// Every booking, latest start first.
    pub async fn bookings(&self) -> Result<Vec<Booking>, EngineError> {
        let mut all: Vec<Booking> = self
            .snapshot()
            .await?
            .into_iter()
            .flat_map(|rs| rs.bookings)
            .collect();
        all.sort_by(|a, b| b.span.start.cmp(&a.span.start));
        Ok(all)
    }

    /// Bookings on one room, latest start first.
    pub async fn bookings_for_room(&self, room_id: RoomId) -> Result<Vec<Booking>, EngineError> {
        let mut all = self.bookings().await?;
        all.retain(|b| b.room_id == room_id);
        Ok(all)
    }

    pub async fn booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        self.store.booking(id).await.ok_or(EngineError::NotFound(id))
    }
}
