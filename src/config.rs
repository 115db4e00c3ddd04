use std::path::PathBuf;
use std::time::Duration;

use crate::backup::BackupSettings;
use crate::limits::MAX_REMINDER_HORIZON_DAYS;
use crate::tenant::TenantSettings;

/// Server configuration, read from `FLEETDESK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sync_interval: Duration,
    pub backup_dir: Option<PathBuf>,
    pub backup_interval: Duration,
    pub backup_retain: usize,
    pub reminder_horizon_days: u32,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    OutOfRange { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "{var}: cannot parse {value:?}"),
            ConfigError::OutOfRange { var, value } => write!(f, "{var}: {value} is out of range"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset and empty variables take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let sync_secs: u64 = parse(&get, "FLEETDESK_SYNC_INTERVAL_SECS", 60)?;
        let backup_secs: u64 = parse(&get, "FLEETDESK_BACKUP_INTERVAL_SECS", 86_400)?;
        let max_connections: usize = parse(&get, "FLEETDESK_MAX_CONNECTIONS", 256)?;
        let reminder_horizon_days: u32 = parse(&get, "FLEETDESK_REMINDER_HORIZON_DAYS", 30)?;

        for (var, value) in [
            ("FLEETDESK_SYNC_INTERVAL_SECS", sync_secs),
            ("FLEETDESK_BACKUP_INTERVAL_SECS", backup_secs),
            ("FLEETDESK_MAX_CONNECTIONS", max_connections as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::OutOfRange { var, value: value.to_string() });
            }
        }
        if reminder_horizon_days > MAX_REMINDER_HORIZON_DAYS {
            return Err(ConfigError::OutOfRange {
                var: "FLEETDESK_REMINDER_HORIZON_DAYS",
                value: reminder_horizon_days.to_string(),
            });
        }

        Ok(Self {
            port: parse(&get, "FLEETDESK_PORT", 5433)?,
            bind: get("FLEETDESK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("FLEETDESK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: get("FLEETDESK_PASSWORD").unwrap_or_else(|| "fleetdesk".into()),
            max_connections,
            compact_threshold: parse(&get, "FLEETDESK_COMPACT_THRESHOLD", 1000)?,
            sync_interval: Duration::from_secs(sync_secs),
            backup_dir: get("FLEETDESK_BACKUP_DIR").map(PathBuf::from),
            backup_interval: Duration::from_secs(backup_secs),
            backup_retain: parse(&get, "FLEETDESK_BACKUP_RETAIN", 7)?,
            reminder_horizon_days,
            tls_cert: get("FLEETDESK_TLS_CERT"),
            tls_key: get("FLEETDESK_TLS_KEY"),
            metrics_port: get("FLEETDESK_METRICS_PORT")
                .map(|v| {
                    v.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
                        var: "FLEETDESK_METRICS_PORT",
                        value: v,
                    })
                })
                .transpose()?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// What each tenant's engine and background tasks run with.
    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            compact_threshold: self.compact_threshold,
            sync_interval: self.sync_interval,
            backup: self.backup_dir.as_ref().map(|dir| BackupSettings {
                dir: dir.clone(),
                retain: self.backup_retain,
            }),
            backup_interval: self.backup_interval,
            reminder_horizon_days: self.reminder_horizon_days,
        }
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }),
    }
}
