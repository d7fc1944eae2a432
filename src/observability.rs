use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "chalet_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "chalet_query_duration_seconds";

/// Counter: booking writes rejected because they overlapped another booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "chalet_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chalet_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chalet_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chalet_connections_rejected_total";

/// Counter: startup and login failures.
pub const AUTH_FAILURES_TOTAL: &str = "chalet_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chalet_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chalet_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "chalet_wal_compactions_total";

// ── Notification outbox ─────────────────────────────────────────

pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "chalet_notifications_delivered_total";

pub const NOTIFICATIONS_FAILED_TOTAL: &str = "chalet_notifications_failed_total";

/// Counter: notifications dropped because the outbox was full or closed.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "chalet_notifications_dropped_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterUser { .. } => "register_user",
        Command::Login { .. } => "login",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectMyBookings => "select_my_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeWindows { .. } => "select_free_windows",
        Command::AdminSelectUsers => "admin_select_users",
        Command::AdminUpdateRole { .. } => "admin_update_role",
        Command::AdminDeleteUser { .. } => "admin_delete_user",
        Command::AdminSelectBookings => "admin_select_bookings",
        Command::AdminDeleteBooking { .. } => "admin_delete_booking",
        Command::AdminSelectStats => "admin_select_stats",
    }
}
