use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetdesk_query_duration_seconds";

/// Counter: reservations rejected because the vehicle was already taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "fleetdesk_reservation_conflicts_total";

/// Counter: vehicle status changes. Labels: status.
pub const VEHICLE_STATUS_TRANSITIONS_TOTAL: &str = "fleetdesk_vehicle_status_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetdesk_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "fleetdesk_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetdesk_wal_flush_batch_size";

/// Counter: backup runs. Labels: status.
pub const BACKUPS_TOTAL: &str = "fleetdesk_backups_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::warn!("metrics exporter not installed: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::UpdateVehicle { .. } => "update_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::SelectVehicles { .. } => "select_vehicles",
        Command::InsertCustomer { .. } => "insert_customer",
        Command::UpdateCustomer { .. } => "update_customer",
        Command::DeleteCustomer { .. } => "delete_customer",
        Command::SelectCustomers { .. } => "select_customers",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::BatchInsertReservations { .. } => "batch_insert_reservations",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectPlaceholders => "select_placeholders",
        Command::SelectSpareCandidates { .. } => "select_spare_candidates",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectAvailableVehicles { .. } => "select_available_vehicles",
        Command::SelectFleetAvailability { .. } => "select_fleet_availability",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectReminders { .. } => "select_reminders",
        Command::InsertExpense { .. } => "insert_expense",
        Command::DeleteExpense { .. } => "delete_expense",
        Command::SelectExpenses { .. } => "select_expenses",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
        Command::Checkpoint => "checkpoint",
    }
}
