use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::backup::{self, BackupSettings};
use crate::engine::{now_ms, Engine, EngineError};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::tasks;

/// What every tenant's engine runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub sync_interval: Duration,
    /// `None` disables backups.
    pub backup: Option<BackupSettings>,
    pub backup_interval: Duration,
    pub reminder_horizon_days: u32,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sync_interval: Duration::from_secs(60),
            backup: None,
            backup_interval: Duration::from_secs(86_400),
            reminder_horizon_days: 30,
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL and
/// background tasks. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
        }
    }

    pub fn settings(&self) -> &TenantSettings {
        &self.settings
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let safe_name = sanitize(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
                slot.insert(engine.clone());
                engine
            }
        };
        self.spawn_tasks(&safe_name, &engine);

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened tenant {safe_name}");
        Ok(engine)
    }

    fn spawn_tasks(&self, safe_name: &str, engine: &Arc<Engine>) {
        tokio::spawn(tasks::run_synchronizer(engine.clone(), self.settings.sync_interval));
        tokio::spawn(tasks::run_compactor(engine.clone(), self.settings.compact_threshold));
        if let Some(backup) = &self.settings.backup {
            tokio::spawn(tasks::run_backups(
                engine.clone(),
                safe_name.to_string(),
                backup.clone(),
                self.settings.backup_interval,
            ));
        }
    }

    /// `CHECKPOINT`: compact the tenant's WAL, then back it up if backups
    /// are configured.
    pub async fn checkpoint(&self, tenant: &str, engine: &Engine) -> Result<(), EngineError> {
        engine.compact_wal().await?;
        if let Some(settings) = &self.settings.backup {
            let safe_name = sanitize(tenant).map_err(|e| EngineError::WalError(e.to_string()))?;
            backup::write_backup(engine, &safe_name, settings, now_ms())
                .await
                .map_err(|e| EngineError::WalError(e.to_string()))?;
        }
        Ok(())
    }
}

/// Tenant name as used in file names: no path separators or dots.
fn sanitize(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe_name)
}
