//! File + environment configuration.
//!
//! Loaded once in `main` from a file (format picked by extension) layered with
//! `MD_SESSION__SECTION__KEY` environment variables, then validated by `check`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::gateway::sim::SimConfig;
use crate::gateway::Credentials;
use crate::market_data::pipeline::PipelineConfig;
use crate::market_data::pool::{AcquirePolicy, PoolConfig};
use crate::session::registry::DEFAULT_MAX_BATCH;
use crate::session::{BackoffConfig, DriverConfig, SessionSettings};
use crate::telemetry::Rotation;

pub const ENV_PREFIX: &str = "MD_SESSION";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("failed to read instruments file {path}: {source}")]
    InstrumentsFile { path: PathBuf, source: std::io::Error },
    #[error("log.level must be within 0..=6, got {0}")]
    LogLevel(u8),
    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange { name: &'static str, min: u64, max: u64, value: u64 },
    #[error("gateway.addresses has no non-empty address")]
    AddressEmpty,
    #[error("gateway.flow_path is empty")]
    FlowPathEmpty,
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("ingest.pool_ceiling ({ceiling}) is below ingest.pool_capacity ({capacity})")]
    CeilingBelowCapacity { capacity: usize, ceiling: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub ingest: IngestSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// 0 trace, 1 debug, 2 info, 3 warn, 4 error, 5 critical, 6 off.
    pub level: u8,
    pub path: Option<PathBuf>,
    /// Size at which the file log rotates, 1..=1024.
    pub file_size_mb: u64,
    /// Rotated files kept besides the live one, 1..=100.
    pub file_num: u64,
    pub rotate_on_open: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: 2, path: None, file_size_mb: 64, file_num: 10, rotate_on_open: false }
    }
}

impl LogSettings {
    pub fn rotation(&self) -> Rotation {
        Rotation {
            max_bytes: usize::try_from(self.file_size_mb.saturating_mul(1 << 20)).unwrap_or(usize::MAX),
            keep: usize::try_from(self.file_num).unwrap_or(usize::MAX),
            rotate_on_open: self.rotate_on_open,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    pub flow_path: String,
    #[serde(default)]
    pub use_udp: bool,
    #[serde(default)]
    pub use_multicast: bool,
    /// Primary first, then alternates. Empty entries are skipped.
    pub addresses: Vec<String>,
    /// Negative waits forever.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: i64,
    #[serde(default = "default_login_retry_times")]
    pub login_retry_times: u32,
    #[serde(default = "default_login_retry_interval_ms")]
    pub login_retry_interval_ms: u64,
    #[serde(default)]
    pub instruments: Vec<String>,
    pub instruments_file: Option<PathBuf>,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Tick period of the simulated venue.
    #[serde(default = "default_sim_tick_ms")]
    pub sim_tick_ms: u64,
}

fn default_connect_timeout_ms() -> i64 {
    3_000
}
fn default_login_retry_times() -> u32 {
    3
}
fn default_login_retry_interval_ms() -> u64 {
    1_000
}
fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_sim_tick_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub workers: usize,
    pub pool_capacity: usize,
    pub pool_ceiling: usize,
    pub pool_policy: AcquirePolicy,
    pub acquire_timeout_ms: u64,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            pool_capacity: 1024,
            pool_ceiling: 4096,
            pool_policy: AcquirePolicy::Block,
            acquire_timeout_ms: 2,
            queue_capacity: 1024,
            enqueue_timeout_ms: 1,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(env_source())
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Parse TOML text, still layered with the environment.
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .add_source(env_source())
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn check(&self) -> Result<(), SettingsError> {
        if self.log.level > 6 {
            return Err(SettingsError::LogLevel(self.log.level));
        }
        let ranged = [
            ("log.file_size_mb", self.log.file_size_mb, 1, 1024),
            ("log.file_num", self.log.file_num, 1, 100),
        ];
        if let Some((name, value, min, max)) = ranged.into_iter().find(|&(_, v, lo, hi)| v < lo || v > hi) {
            return Err(SettingsError::OutOfRange { name, min, max, value });
        }
        if self.gateway.flow_path.trim().is_empty() {
            return Err(SettingsError::FlowPathEmpty);
        }
        if self.addresses().is_empty() {
            return Err(SettingsError::AddressEmpty);
        }
        let positive = [
            ("gateway.login_retry_times", self.gateway.login_retry_times as usize),
            ("gateway.max_batch", self.gateway.max_batch),
            ("ingest.workers", self.ingest.workers),
            ("ingest.pool_capacity", self.ingest.pool_capacity),
            ("ingest.queue_capacity", self.ingest.queue_capacity),
        ];
        if let Some((name, _)) = positive.into_iter().find(|&(_, v)| v == 0) {
            return Err(SettingsError::Zero(name));
        }
        if self.ingest.pool_policy == AcquirePolicy::Grow && self.ingest.pool_ceiling < self.ingest.pool_capacity {
            return Err(SettingsError::CeilingBelowCapacity {
                capacity: self.ingest.pool_capacity,
                ceiling: self.ingest.pool_ceiling,
            });
        }
        Ok(())
    }

    pub fn addresses(&self) -> Vec<String> {
        self.gateway
            .addresses
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        u64::try_from(self.gateway.connect_timeout_ms).ok().map(Duration::from_millis)
    }

    /// Inline instruments followed by those in `instruments_file`.
    pub fn instruments(&self) -> Result<Vec<String>, SettingsError> {
        let mut out = self.gateway.instruments.clone();
        if let Some(path) = &self.gateway.instruments_file {
            let text = fs::read_to_string(path)
                .map_err(|source| SettingsError::InstrumentsFile { path: path.clone(), source })?;
            out.extend(parse_instrument_list(&text));
        }
        Ok(out)
    }

    pub fn session_settings(&self) -> Result<SessionSettings, SettingsError> {
        Ok(SessionSettings {
            credentials: self.gateway.credentials.clone(),
            flow_path: self.gateway.flow_path.clone(),
            max_batch: self.gateway.max_batch,
            instruments: self.instruments()?,
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let i = &self.ingest;
        PipelineConfig {
            workers: i.workers,
            queue_capacity: i.queue_capacity,
            enqueue_timeout: Duration::from_millis(i.enqueue_timeout_ms),
            pool: PoolConfig {
                capacity: i.pool_capacity,
                ceiling: i.pool_ceiling,
                policy: i.pool_policy,
                acquire_timeout: Duration::from_millis(i.acquire_timeout_ms),
            },
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            addresses: self.addresses(),
            connect_timeout: self.connect_timeout(),
            login_retry_times: self.gateway.login_retry_times,
            login_retry_interval: Duration::from_millis(self.gateway.login_retry_interval_ms),
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(self.gateway.reconnect_initial_ms),
                max_delay: Duration::from_millis(self.gateway.reconnect_max_ms),
                ..BackoffConfig::default()
            },
            ..DriverConfig::default()
        }
    }

    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            flow_path: self.gateway.flow_path.clone(),
            use_udp: self.gateway.use_udp,
            use_multicast: self.gateway.use_multicast,
            tick_interval: Duration::from_millis(self.gateway.sim_tick_ms),
            ..SimConfig::default()
        }
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// One identifier per line; blank lines and `#` comments are skipped.
pub fn parse_instrument_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
