use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Gateway connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Target company; empty means whichever company is active on the gateway.
    pub company: String,
    /// Reporting window, ISO dates.
    pub from_date: String,
    pub to_date: String,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            company: String::new(),
            from_date: "2025-04-01".to_string(),
            to_date: "2026-03-31".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Embedded store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    /// Declarative CREATE-TABLE file applied idempotently at bootstrap.
    pub schema_path: String,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "./syncline.db".to_string(),
            schema_path: "./db-schema.sql".to_string(),
            busy_timeout_ms: 30_000,
        }
    }
}

/// Synchronizer behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Fan out gateway extraction concurrently during full sync. Inserts stay
    /// sequential in declaration order either way.
    pub parallel: bool,
    pub batch_size: usize,
    /// Declarative table-spec file (top-level `master` / `transaction`).
    pub spec_path: String,
    /// Crash-state sidecar file.
    pub state_path: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            batch_size: 1000,
            spec_path: "./table-specs.yaml".to_string(),
            state_path: "./sync-state.json".to_string(),
        }
    }
}

/// Backoff growth strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Exponential,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub strategy: RetryStrategy,
    pub backoff_multiplier: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay_ms: 5_000,
            strategy: RetryStrategy::Exponential,
            backoff_multiplier: 2,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

/// Cron-like trigger settings for unattended syncs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// "full" or "incremental".
    pub kind: String,
    /// Time of day, `HH:MM`.
    pub time: String,
    /// Days of week, lowercase three-letter names.
    pub days: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: "incremental".to_string(),
            time: "06:00".to_string(),
            days: ["mon", "tue", "wed", "thu", "fri", "sat"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub sync: SyncOptions,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub schedule: ScheduleConfig,
}

/// Loads configuration from a YAML file; a missing file yields defaults so a
/// fresh checkout runs against a local gateway without any setup.
pub fn load_config(path: &Path) -> Result<AppConfig, SyncError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|err| SyncError::Config(format!("failed to read {}: {err}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|err| SyncError::Config(format!("failed to parse {}: {err}", path.display())))
}
