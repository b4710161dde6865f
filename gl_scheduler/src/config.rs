//! ABOUTME: Scheduler configuration: defaults, validation and env/file loading
//! ABOUTME: Mirrors the workspace's config+validator convention for other settings structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

/// Backing store selection. Unknown values fall back to `Memory` with a
/// warning logged by whoever constructs the config (see `StorageType::parse`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    File,
}

impl StorageType {
    /// Parse a free-form string (as would arrive from an external config
    /// feeder), falling back to `Memory` for anything unrecognized. The
    /// caller is expected to log the fallback at Warn; this function stays
    /// pure so it's trivially testable.
    pub fn parse_lossy(raw: &str) -> (Self, bool) {
        match raw.to_ascii_lowercase().as_str() {
            "file" => (Self::File, true),
            "memory" => (Self::Memory, true),
            _ => (Self::Memory, false),
        }
    }
}

/// Scheduler configuration. All fields have defaults matching `spec.md`
/// §6; `Validate` enforces the same lower bounds the spec's table lists.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerConfig {
    #[validate(range(min = 1))]
    pub worker_count: usize,

    #[validate(range(min = 1))]
    pub queue_size: usize,

    #[validate(range(min = 1))]
    pub shutdown_timeout_secs: u64,

    pub storage_type: StorageType,

    #[validate(range(min = 1))]
    pub check_interval_secs: u64,

    #[validate(range(min = 1))]
    pub retention_days: u32,

    pub persistence_file: PathBuf,

    pub enable_persistence: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            queue_size: 100,
            shutdown_timeout_secs: 30,
            storage_type: StorageType::Memory,
            check_interval_secs: 1,
            retention_days: 7,
            persistence_file: PathBuf::from("scheduler_jobs.json"),
            enable_persistence: false,
        }
    }
}

/// Mirror of `SchedulerConfig` with `storage_type` left as a raw string, so
/// an unrecognized value can be downgraded to `Memory` with a warning
/// instead of failing config deserialization outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RawSchedulerConfig {
    worker_count: usize,
    queue_size: usize,
    shutdown_timeout_secs: u64,
    storage_type: String,
    check_interval_secs: u64,
    retention_days: u32,
    persistence_file: PathBuf,
    enable_persistence: bool,
}

impl Default for RawSchedulerConfig {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            worker_count: defaults.worker_count,
            queue_size: defaults.queue_size,
            shutdown_timeout_secs: defaults.shutdown_timeout_secs,
            storage_type: "memory".to_string(),
            check_interval_secs: defaults.check_interval_secs,
            retention_days: defaults.retention_days,
            persistence_file: defaults.persistence_file,
            enable_persistence: defaults.enable_persistence,
        }
    }
}

impl SchedulerConfig {
    /// Layer environment variables (prefixed `SCHEDULER_`, e.g.
    /// `SCHEDULER_WORKER_COUNT`) over the defaults, the same layering
    /// order the workspace's `gl_config` crate uses for the rest of the
    /// application's settings. An unrecognized `storage_type` falls back to
    /// `Memory` with a warning rather than failing the load.
    pub fn from_env() -> gl_core::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&RawSchedulerConfig::default())?)
            .add_source(config::Environment::with_prefix("SCHEDULER"));

        let raw: RawSchedulerConfig = builder.build()?.try_deserialize()?;
        let (storage_type, recognized) = StorageType::parse_lossy(&raw.storage_type);
        if !recognized {
            tracing::warn!(
                value = raw.storage_type.as_str(),
                "unrecognized storage_type, falling back to memory"
            );
        }

        let config = Self {
            worker_count: raw.worker_count,
            queue_size: raw.queue_size,
            shutdown_timeout_secs: raw.shutdown_timeout_secs,
            storage_type,
            check_interval_secs: raw.check_interval_secs,
            retention_days: raw.retention_days,
            persistence_file: raw.persistence_file,
            enable_persistence: raw.enable_persistence,
        };
        config.validate_or_err()?;
        Ok(config)
    }

    fn validate_or_err(&self) -> gl_core::Result<()> {
        self.validate()
            .map_err(|e| gl_core::Error::Validation(e.to_string()))
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs)
    }

    pub fn retention_duration(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    /// Cadence for the retention sweep: once per `min(RetentionDays, 1) *
    /// 24h`, floored to an hour so a sub-hour interval never results.
    pub fn retention_sweep_interval(&self) -> std::time::Duration {
        let days = self.retention_days.min(1) as u64;
        let hours = (days * 24).max(1);
        std::time::Duration::from_secs(hours * 3600)
    }
}
