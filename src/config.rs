use chrono::TimeDelta;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode};

use crate::{
    engine::BackendConfig,
    framework::{backend::DEFAULT_ROLLBACK_MIN_AGE, StaticSystemView},
};

/// Process configuration, read from `CREDVAULT_*` environment variables.
///
/// Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_lease_ttl")]
    pub default_lease_ttl: i64,
    #[serde(default = "default_lease_ttl")]
    pub max_lease_ttl: i64,
    #[serde(default = "default_rollback_min_age")]
    pub rollback_min_age: i64,
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval: u64,
    #[serde(default = "default_min_rotation_period")]
    pub min_rotation_period: i64,
    pub max_rotation_period: Option<i64>,
}

fn default_bind_address() -> String {
    "127.0.0.1:8200".to_owned()
}

fn default_lease_ttl() -> i64 {
    TimeDelta::hours(768).num_seconds()
}

fn default_rollback_min_age() -> i64 {
    DEFAULT_ROLLBACK_MIN_AGE.num_seconds()
}

fn default_periodic_interval() -> u64 {
    60
}

fn default_min_rotation_period() -> i64 {
    60
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("CREDVAULT_").from_env::<Self>()?)
    }

    /// SQLite connection options; an in-memory database when `db_path` is unset.
    pub fn connect_options(&self) -> SqliteConnectOptions {
        match &self.db_path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
            None => SqliteConnectOptions::new().in_memory(true),
        }
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
    }

    pub fn periodic_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.periodic_interval.max(1))
    }

    pub fn system_view(&self) -> StaticSystemView {
        StaticSystemView::builder()
            .default_lease_ttl(TimeDelta::seconds(self.default_lease_ttl))
            .max_lease_ttl(TimeDelta::seconds(self.max_lease_ttl))
            .build()
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::builder()
            .system(std::sync::Arc::new(self.system_view()))
            .rollback_min_age(TimeDelta::seconds(self.rollback_min_age))
            .min_rotation_period(TimeDelta::seconds(self.min_rotation_period))
            .maybe_max_rotation_period(self.max_rotation_period.map(TimeDelta::seconds))
            .build()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            bind_address: default_bind_address(),
            default_lease_ttl: default_lease_ttl(),
            max_lease_ttl: default_lease_ttl(),
            rollback_min_age: default_rollback_min_age(),
            periodic_interval: default_periodic_interval(),
            min_rotation_period: default_min_rotation_period(),
            max_rotation_period: None,
        }
    }
}
