use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorConfig, LeaseCoordinator};
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Knobs every tenant shares.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub utc_offset: FixedOffset,
    pub coordinator: CoordinatorConfig,
}

impl From<&ServerConfig> for TenantSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            compact_threshold: cfg.compact_threshold,
            sweep_interval: cfg.sweep_interval,
            utc_offset: cfg.utc_offset,
            coordinator: cfg.coordinator.clone(),
        }
    }
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// One isolated lease store: its own engine, WAL and coordinator.
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub coordinator: LeaseCoordinator,
}

/// Lease stores keyed by the database name a client connects to. A tenant's
/// engine, WAL file, reaper and compactor come into being on first use.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            settings,
        }
    }

    /// Get or lazily create the tenant for `name`. Names that sanitize to the
    /// same file name are the same tenant.
    pub fn get_or_create(&self, name: &str) -> std::io::Result<Arc<Tenant>> {
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        // The name becomes a file name; keep it inside data_dir.
        let safe_name: String = name
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(tenant) = self.tenants.get(&safe_name) {
            return Ok(tenant.value().clone());
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to create the same tenant; the entry lock
        // makes the loser reuse the winner's engine.
        let tenant = match self.tenants.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(vacant) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let clock = Clock::system(self.settings.utc_offset);
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()), clock)?);
                let coordinator =
                    LeaseCoordinator::for_engine(engine.clone(), self.settings.coordinator.clone());
                self.spawn_background(&engine);
                vacant.insert(Arc::new(Tenant {
                    engine,
                    coordinator,
                }))
                .clone()
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(tenant)
    }

    fn spawn_background(&self, engine: &Arc<Engine>) {
        tokio::spawn(reaper::run_reaper(
            engine.clone(),
            self.settings.sweep_interval,
        ));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
            COMPACT_CHECK_INTERVAL,
        ));
    }
}
