use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub listener: ListenerConfig,
    #[serde(default)]
    pub wal2json: Wal2JsonOptions,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub slot_name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Empty polls in a row before the interval grows.
    #[serde(default = "default_throttle_threshold")]
    pub throttle_threshold: u32,
    #[serde(default = "default_interval_step_ms")]
    pub interval_step_ms: u64,
    #[serde(default)]
    pub slot_policy: SlotPolicy,
}

/// What `start()` does when the replication slot is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Create the slot if missing, reuse it otherwise.
    #[default]
    Reuse,
    /// Create the slot if missing, fail with `SlotConflict` otherwise.
    RequireNew,
}

/// Options passed to the wal2json output plugin on every read.
///
/// Flags are sent as `"1"`/`"0"`, the way the plugin expects them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Wal2JsonOptions {
    pub include_xids: bool,
    pub include_timestamp: bool,
    pub include_types: bool,
    pub filter_tables: Option<String>,
    pub add_tables: Option<String>,
    /// Any other plugin option, passed through verbatim.
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Zero keeps entries forever.
    pub ttl_secs: u64,
    pub sweep_fraction: f64,
    /// Schemas whose primary keys are loaded; empty means every user schema.
    pub schemas: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub postgres: Option<PostgresConfig>,
    pub create_table: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Postgres,
    Stdout,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("WAL_LOGGER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Checks the settings the pipeline cannot run without.
    pub fn validate(&self) -> Result<()> {
        self.postgres.validate("postgres")?;
        if let Some(sink) = &self.sink.postgres {
            sink.validate("sink.postgres")?;
        }

        let listener = &self.listener;
        if listener.slot_name.is_empty() {
            return Err(Error::Config("listener.slot_name isn't set".to_string()));
        }
        if listener.min_interval_ms > listener.poll_interval_ms
            || listener.poll_interval_ms > listener.max_interval_ms
        {
            return Err(Error::Config(format!(
                "expected min_interval_ms ({}) <= poll_interval_ms ({}) <= max_interval_ms ({})",
                listener.min_interval_ms, listener.poll_interval_ms, listener.max_interval_ms
            )));
        }
        if listener.throttle_threshold == 0 {
            return Err(Error::Config(
                "listener.throttle_threshold must be at least 1".to_string(),
            ));
        }
        if !(self.cache.sweep_fraction > 0.0 && self.cache.sweep_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "cache.sweep_fraction must be in (0, 1], got {}",
                self.cache.sweep_fraction
            )));
        }

        Ok(())
    }

    pub fn postgres_connection(&self) -> tokio_postgres::Config {
        self.postgres.connection_config()
    }

    /// Connection settings for the `log` table, falling back to the source.
    pub fn sink_postgres(&self) -> &PostgresConfig {
        self.sink.postgres.as_ref().unwrap_or(&self.postgres)
    }
}

impl PostgresConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::Config(format!("{}.username isn't set", section)));
        }
        if self.password.is_empty() {
            return Err(Error::Config(format!("{}.password isn't set", section)));
        }
        if self.database.is_empty() {
            return Err(Error::Config(format!("{}.database isn't set", section)));
        }
        Ok(())
    }

    /// Connection settings for tokio-postgres. Credentials are passed as
    /// separate fields, so they need no escaping.
    pub fn connection_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password);
        if self.connect_timeout_secs > 0 {
            config.connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        }
        config
    }
}

impl ListenerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Wal2JsonOptions {
    /// Flattens the options into the `key, value, key, value...` list taken
    /// by the variadic argument of `pg_logical_slot_peek_changes`.
    pub fn to_variadic(&self) -> Vec<String> {
        let mut options = Vec::new();
        let mut push = |key: &str, value: String| {
            options.push(key.to_string());
            options.push(value);
        };

        push("include-xids", flag(self.include_xids));
        push("include-timestamp", flag(self.include_timestamp));
        push("include-types", flag(self.include_types));
        if let Some(tables) = &self.filter_tables {
            push("filter-tables", tables.clone());
        }
        if let Some(tables) = &self.add_tables {
            push("add-tables", tables.clone());
        }
        for (key, value) in &self.extra {
            push(key, value.clone());
        }

        options
    }
}

fn flag(enabled: bool) -> String {
    let value = if enabled { "1" } else { "0" };
    value.to_string()
}

impl Default for Wal2JsonOptions {
    fn default() -> Self {
        Self {
            include_xids: true,
            include_timestamp: false,
            include_types: true,
            filter_tables: None,
            add_tables: None,
            extra: BTreeMap::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 0,
            sweep_fraction: 0.2,
            schemas: Vec::new(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Postgres,
            postgres: None,
            create_table: true,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_min_interval_ms() -> u64 {
    100
}

fn default_max_interval_ms() -> u64 {
    10_000 // 10s
}

fn default_throttle_threshold() -> u32 {
    10
}

fn default_interval_step_ms() -> u64 {
    500
}
