//! Process configuration, read once from `SLOTLOCK_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;

use crate::auth::AccessPolicy;
use crate::clock::offset_from_minutes;
use crate::coordinator::CoordinatorConfig;

/// US Eastern standard time, the dashboard's operating zone.
const DEFAULT_UTC_OFFSET: FixedOffset = match FixedOffset::west_opt(5 * 3600) {
    Some(offset) => offset,
    None => panic!("offset out of range"),
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Logins granted the admin role.
    pub admins: Vec<String>,
    pub super_admins: Vec<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub utc_offset: FixedOffset,
    pub coordinator: CoordinatorConfig,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotlock".into(),
            admins: vec!["admin".into()],
            super_admins: Vec::new(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(30),
            utc_offset: DEFAULT_UTC_OFFSET,
            coordinator: CoordinatorConfig::default(),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = get("SLOTLOCK_BIND") {
            cfg.bind = v;
        }
        if let Some(v) = get("SLOTLOCK_PORT") {
            cfg.port = parse("SLOTLOCK_PORT", v)?;
        }
        if let Some(v) = get("SLOTLOCK_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SLOTLOCK_PASSWORD") {
            cfg.password = v;
        }
        if let Some(v) = get("SLOTLOCK_ADMINS") {
            cfg.admins = name_list(&v);
        }
        if let Some(v) = get("SLOTLOCK_SUPER_ADMINS") {
            cfg.super_admins = name_list(&v);
        }
        if let Some(v) = get("SLOTLOCK_MAX_CONNECTIONS") {
            cfg.max_connections = parse("SLOTLOCK_MAX_CONNECTIONS", v)?;
        }
        if let Some(v) = get("SLOTLOCK_COMPACT_THRESHOLD") {
            cfg.compact_threshold = parse("SLOTLOCK_COMPACT_THRESHOLD", v)?;
        }
        if let Some(v) = get("SLOTLOCK_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse("SLOTLOCK_SWEEP_INTERVAL_SECS", v.clone())?;
            if secs == 0 {
                return Err(ConfigError {
                    var: "SLOTLOCK_SWEEP_INTERVAL_SECS",
                    value: v,
                });
            }
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = get("SLOTLOCK_UTC_OFFSET_MINUTES") {
            let minutes: i32 = parse("SLOTLOCK_UTC_OFFSET_MINUTES", v.clone())?;
            cfg.utc_offset = offset_from_minutes(minutes).ok_or(ConfigError {
                var: "SLOTLOCK_UTC_OFFSET_MINUTES",
                value: v,
            })?;
        }
        if let Some(v) = get("SLOTLOCK_SINGLE_LEASE_PER_HOLDER") {
            cfg.coordinator.single_lease_per_holder = parse_bool("SLOTLOCK_SINGLE_LEASE_PER_HOLDER", v)?;
        }
        if let Some(v) = get("SLOTLOCK_AUTOSAVE_GRACE_SECS") {
            let secs: i64 = parse("SLOTLOCK_AUTOSAVE_GRACE_SECS", v)?;
            cfg.coordinator.autosave_grace_ms = secs.saturating_mul(1000);
        }
        cfg.tls_cert = get("SLOTLOCK_TLS_CERT");
        cfg.tls_key = get("SLOTLOCK_TLS_KEY");
        if let Some(v) = get("SLOTLOCK_METRICS_PORT") {
            cfg.metrics_port = Some(parse("SLOTLOCK_METRICS_PORT", v)?);
        }

        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy::new(
            self.password.clone(),
            self.admins.iter().cloned(),
            self.super_admins.iter().cloned(),
        )
    }
}

/// Comma-separated login names; blanks dropped.
fn name_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .collect()
}

fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError { var, value })
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError { var, value }),
    }
}
