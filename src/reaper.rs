use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Periodically release reservations whose hold has lapsed.
///
/// Purely an optimisation: every read and write path already ignores expired
/// reservations.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let reaped = reap_once(&engine).await;
        if reaped > 0 {
            info!(reaped, "released expired reservations");
        }
    }
}

/// One sweep. Returns how many reservations were released.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = engine.now();
    let mut reaped = 0;
    for (reservation_id, staff_id) in engine.collect_expired_reservations(now) {
        match engine.reap_reservation(reservation_id, now).await {
            Ok(true) => reaped += 1,
            Ok(false) => debug!(%reservation_id, "reservation renewed before reaping"),
            // Released or consumed by someone else in the meantime.
            Err(e) => debug!(%reservation_id, %staff_id, error = %e, "reaper skip"),
        }
    }
    reaped
}

/// Compact the WAL once `threshold` appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!(error = %e, appends, "WAL compaction failed");
        }
    }
}
