use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::engine::Engine;
use crate::model::{Event, Ms};
use crate::wal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    pub dir: PathBuf,
    /// Backups kept per tenant. Older ones are deleted after each run.
    pub retain: usize,
}

/// Write a compacted copy of `engine`'s log to `<dir>/<tenant>-<ms>.wal`.
/// The copy has the log format, so restoring is a file copy.
pub async fn write_backup(
    engine: &Engine,
    tenant: &str,
    settings: &BackupSettings,
    now: Ms,
) -> io::Result<PathBuf> {
    let events = engine.snapshot_events().await;
    let result = write_backup_file(&settings.dir, tenant, now, &events)
        .and_then(|path| prune(&settings.dir, tenant, settings.retain).map(|_| path));

    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(crate::observability::BACKUPS_TOTAL, "status" => status).increment(1);
    match &result {
        Ok(path) => tracing::info!("backup of {tenant}: {} ({} events)", path.display(), events.len()),
        Err(e) => tracing::error!("backup of {tenant} failed: {e}"),
    }
    result
}

fn write_backup_file(
    dir: &Path,
    tenant: &str,
    now: Ms,
    events: &[Event],
) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{tenant}-{now}.wal"));
    let staging = dir.join(format!(".{tenant}-{now}.wal.tmp"));
    wal::write_snapshot(&staging, events)?;
    fs::rename(&staging, &path)?;
    Ok(path)
}

/// Backups of `tenant` in `dir`, oldest first.
pub fn list_backups(dir: &Path, tenant: &str) -> io::Result<Vec<PathBuf>> {
    let prefix = format!("{tenant}-");
    let mut found: Vec<(Ms, PathBuf)> = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // All-digit suffix only: `acme-eu-5.wal` is not a backup of `acme`.
        if let Some(stamp) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".wal"))
            .and_then(|stamp| stamp.parse::<Ms>().ok())
        {
            found.push((stamp, path));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Delete all but the newest `retain` backups of `tenant`. Returns how many
/// were removed.
pub fn prune(dir: &Path, tenant: &str, retain: usize) -> io::Result<usize> {
    let backups = list_backups(dir, tenant)?;
    let excess = backups.len().saturating_sub(retain);
    for path in &backups[..excess] {
        fs::remove_file(path)?;
        tracing::debug!("removed old backup {}", path.display());
    }
    Ok(excess)
}
