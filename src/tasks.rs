use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backup::{self, BackupSettings};
use crate::engine::{now_ms, Engine};

/// Background task that re-derives vehicle statuses from the clock, so a
/// rental starting at 09:00 marks its car rented without anyone touching it.
pub async fn run_synchronizer(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let changed = engine.sync_all(now_ms()).await;
        if changed > 0 {
            info!("status sync updated {changed} vehicle(s)");
        }
    }
}

/// Background task that compacts the WAL once enough events pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!("WAL compaction failed: {e}");
        } else {
            tracing::debug!("compacted WAL after {appends} appends");
        }
    }
}

/// Background task that writes a backup of one tenant every `every`.
/// The first tick fires immediately, so a fresh start is backed up too.
pub async fn run_backups(engine: Arc<Engine>, tenant: String, settings: BackupSettings, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        // Failures are logged and counted inside; try again next tick.
        let _ = backup::write_backup(&engine, &tenant, &settings, now_ms()).await;
    }
}
