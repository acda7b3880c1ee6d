use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::{now_ms, Ms};

const COMPACT_INTERVAL: Duration = Duration::from_secs(60);
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Compact when `threshold` appends have accumulated. Returns whether it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.store.compact().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!(error = %e, "WAL compaction failed");
            false
        }
    }
}

/// Background task that cancels PENDING bookings nobody confirmed in time.
pub async fn run_pending_reaper(engine: Arc<Engine>, ttl: Duration) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_pending(&engine, ttl_ms(ttl)).await;
    }
}

/// `ttl` in milliseconds, saturating at `Ms::MAX`.
pub fn ttl_ms(ttl: Duration) -> Ms {
    Ms::try_from(ttl.as_millis()).unwrap_or(Ms::MAX)
}

/// One sweep. Returns how many bookings were expired.
pub async fn reap_pending(engine: &Engine, ttl: Ms) -> usize {
    let mut expired = 0;
    for id in engine.stale_pending(now_ms(), ttl) {
        match engine.expire_pending(id).await {
            Ok(_) => expired += 1,
            // Confirmed or cancelled since the sweep read it.
            Err(e) => debug!(booking = %id, error = %e, "reaper skip"),
        }
    }
    expired
}
