use std::net::SocketAddr;

use crate::command::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "drivetime_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "drivetime_command_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "drivetime_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "drivetime_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "drivetime_connections_rejected_total";

/// Histogram: persistence round duration in seconds.
pub const PERSIST_FLUSH_DURATION_SECONDS: &str = "drivetime_persist_flush_duration_seconds";

/// Histogram: collections written per persistence round.
pub const PERSIST_BATCH_SIZE: &str = "drivetime_persist_batch_size";

/// Counter: snapshots that exhausted their retries. Labels: collection.
pub const PERSIST_FAILURES_TOTAL: &str = "drivetime_persist_failures_total";

/// Counter: retried snapshot writes. Labels: collection.
pub const PERSIST_RETRIES_TOTAL: &str = "drivetime_persist_retries_total";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: pending requests left unapprovable by an overlapping approval.
pub const BOOKINGS_CONTESTED_TOTAL: &str = "drivetime_bookings_contested_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::AddAvailability { .. } => "add_availability",
        Command::RemoveAvailability { .. } => "remove_availability",
        Command::CreateBooking { .. } => "create_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::ListAvailability { .. } => "list_availability",
        Command::ListBookings { .. } => "list_bookings",
        Command::SlotAt { .. } => "slot_at",
        Command::BookingAt { .. } => "booking_at",
        Command::ResolveWeek { .. } => "resolve_week",
        Command::ColorFor { .. } => "color_for",
        Command::Subscribe { .. } => "subscribe",
        Command::Flush => "flush",
    }
}
