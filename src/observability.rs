use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::EnvFilter;

// ── Booking path ────────────────────────────────────────────────

/// Counter: bookings committed (create and modify replacements).
pub const BOOKINGS_CREATED_TOTAL: &str = "kennel_bookings_created_total";

/// Counter: create/modify attempts rejected by the availability check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "kennel_booking_conflicts_total";

/// Counter: status transitions. Labels: status.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "kennel_booking_transitions_total";

/// Counter: optimistic-concurrency retries after a version mismatch.
pub const VERSION_RETRIES_TOTAL: &str = "kennel_version_retries_total";

/// Histogram: time spent waiting for a room lock, in seconds.
pub const ROOM_LOCK_WAIT_SECONDS: &str = "kennel_room_lock_wait_seconds";

/// Counter: room lock acquisitions that timed out.
pub const ROOM_LOCK_TIMEOUTS_TOTAL: &str = "kennel_room_lock_timeouts_total";

// ── Real-time layer ─────────────────────────────────────────────

/// Counter: events handed to the broadcaster. Labels: event.
pub const EVENTS_PUBLISHED_TOTAL: &str = "kennel_events_published_total";

/// Counter: events skipped by lagging subscribers.
pub const EVENTS_DROPPED_TOTAL: &str = "kennel_events_dropped_total";

/// Gauge: open gateway connections.
pub const CONNECTIONS_ACTIVE: &str = "kennel_connections_active";

/// Counter: gateway connections accepted.
pub const CONNECTIONS_TOTAL: &str = "kennel_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "kennel_connections_rejected_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kennel_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kennel_wal_flush_batch_size";

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Install Prometheus metrics exporter on `addr`. No-op if `addr` is None.
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<(), BuildError> {
    let Some(addr) = addr else { return Ok(()) };
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}
