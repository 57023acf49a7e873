use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: commit attempts. Labels: outcome (booked, slot_taken, rejected, error).
pub const BOOKINGS_TOTAL: &str = "slotwise_bookings_total";

/// Counter: reserve attempts. Labels: outcome (placed, renewed, moved, slot_taken, rejected, error).
pub const RESERVATIONS_TOTAL: &str = "slotwise_reservations_total";

/// Counter: expired reservations released by the reaper.
pub const RESERVATIONS_REAPED_TOTAL: &str = "slotwise_reservations_reaped_total";

/// Histogram: time spent waiting for a staff write lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotwise_lock_wait_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Outcome label for a write-path result.
pub fn outcome_label<T>(result: &Result<T, crate::engine::EngineError>, ok: &'static str) -> &'static str {
    use crate::engine::EngineError;
    match result {
        Ok(_) => ok,
        Err(EngineError::SlotTaken(_)) => "slot_taken",
        Err(e) if e.is_retryable() => "error",
        Err(_) => "rejected",
    }
}

/// Short metrics label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertService { .. } => "upsert_service",
        Command::InsertStaff { .. } => "insert_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::AssignServices { .. } => "assign_services",
        Command::UnassignService { .. } => "unassign_service",
        Command::SetWorkingHours { .. } => "set_working_hours",
        Command::InsertTimeOff { .. } => "insert_time_off",
        Command::DeleteTimeOff { .. } => "delete_time_off",
        Command::Reserve { .. } => "reserve",
        Command::ReleaseReservation { .. } => "release_reservation",
        Command::BookAppointment { .. } => "book_appointment",
        Command::SetAppointmentStatus { .. } => "set_appointment_status",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectMonthAvailability { .. } => "select_month_availability",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectTimeOff { .. } => "select_time_off",
        Command::SelectWorkingHours { .. } => "select_working_hours",
        Command::SelectServices => "select_services",
        Command::SelectStaff => "select_staff",
    }
}
