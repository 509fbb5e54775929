use std::net::SocketAddr;

// ── Lifecycle (request-driven) ──────────────────────────────────

/// Counter: lifecycle operations. Labels: op, status.
pub const LIFECYCLE_OPS_TOTAL: &str = "allocra_lifecycle_ops_total";

/// Histogram: lifecycle operation latency in seconds. Labels: op.
pub const LIFECYCLE_OP_DURATION_SECONDS: &str = "allocra_lifecycle_op_duration_seconds";

/// Counter: booking rows recorded. Labels: status (approved/rejected/pending).
pub const BOOKINGS_RECORDED_TOTAL: &str = "allocra_bookings_recorded_total";

/// Counter: approved bookings demoted by a forced allocation.
pub const BOOKINGS_DISPLACED_TOTAL: &str = "allocra_bookings_displaced_total";

// ── Store (resource utilization) ────────────────────────────────

/// Histogram: time spent waiting for a room's exclusive lock, in seconds.
pub const ROOM_LOCK_WAIT_SECONDS: &str = "allocra_room_lock_wait_seconds";

/// Counter: finished transactions. Labels: outcome (committed/rolled_back).
pub const TX_TOTAL: &str = "allocra_transactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "allocra_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "allocra_wal_flush_batch_size";

/// Counter: WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "allocra_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
