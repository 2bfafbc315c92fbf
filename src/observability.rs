use std::net::SocketAddr;

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "reserva_bookings_created_total";

/// Counter: create requests rejected for overlapping an active booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "reserva_booking_conflicts_total";

/// Counter: status transitions. Labels: transition, outcome (applied|noop).
pub const TRANSITIONS_TOTAL: &str = "reserva_transitions_total";

// ── Calendar cache ──────────────────────────────────────────────

/// Counter: calendar lookups. Labels: outcome (hit|miss|fallback).
pub const CACHE_REQUESTS_TOTAL: &str = "reserva_cache_requests_total";

/// Counter: failed cache writes/invalidations.
pub const CACHE_ERRORS_TOTAL: &str = "reserva_cache_errors_total";

// ── Scheduler ───────────────────────────────────────────────────

/// Counter: task executions. Labels: task, status (ok|retry|dropped).
pub const TASKS_TOTAL: &str = "reserva_tasks_total";

/// Histogram: task execution time in seconds. Labels: task.
pub const TASK_DURATION_SECONDS: &str = "reserva_task_duration_seconds";

/// Counter: notifications. Labels: kind, status (sent|failed).
pub const NOTIFICATIONS_TOTAL: &str = "reserva_notifications_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reserva_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reserva_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
