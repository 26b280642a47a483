use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotlock_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotlock_query_duration_seconds";

// ── Lease lifecycle ─────────────────────────────────────────────

/// Counter: leases created (idempotent re-acquires excluded).
pub const LEASES_ACQUIRED_TOTAL: &str = "slotlock_leases_acquired_total";

/// Counter: acquisitions refused because another holder owns the key.
pub const LEASE_CONFLICTS_TOTAL: &str = "slotlock_lease_conflicts_total";

/// Counter: leases removed. Labels: reason.
pub const LEASES_RELEASED_TOTAL: &str = "slotlock_leases_released_total";

/// Counter: observation entries appended. Labels: origin.
pub const ENTRIES_APPENDED_TOTAL: &str = "slotlock_entries_appended_total";

/// Gauge: live leases whose resource is no longer registered.
pub const STALE_LEASES: &str = "slotlock_stale_leases";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotlock_connections_active";
pub const CONNECTIONS_TOTAL: &str = "slotlock_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotlock_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "slotlock_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotlock_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotlock_wal_flush_batch_size";

/// Install the Prometheus exporter when a port is configured.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterResource { .. } => "register_resource",
        Command::UnregisterResource { .. } => "unregister_resource",
        Command::SelectResources => "select_resources",
        Command::Acquire { .. } => "acquire",
        Command::Release { .. } => "release",
        Command::ForceRelease { .. } => "force_release",
        Command::ReleaseAll { .. } => "release_all",
        Command::SelectLeases { .. } => "select_leases",
        Command::SelectStaleLeases => "select_stale_leases",
        Command::CreateEntry { .. } => "create_entry",
        Command::SelectEntries { .. } => "select_entries",
        Command::MarkComplete { .. } => "mark_complete",
    }
}
