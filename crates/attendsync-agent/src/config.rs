// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use attendsync_core::capture::CaptureConfig;
use attendsync_core::circuit_breaker::BreakerConfig;
use attendsync_core::disk::DiskConfig;
use attendsync_core::remote::HttpBackendConfig;
use attendsync_core::shutdown::ShutdownConfig;
use attendsync_core::sync::SyncConfig;

use crate::connectivity_probe::ConnectivityProbeConfig;
use crate::disk_cleanup_worker::DiskCleanupWorkerConfig;
use crate::queue_drain_worker::QueueDrainWorkerConfig;

const MB: u64 = 1024 * 1024;
const DAY: u64 = 24 * 3600;

/// Kiosk agent configuration.
#[derive(Clone)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Backend REST base URL.
    pub backend_url: String,
    /// Bearer token for the backend.
    pub api_key: String,
    /// Identifier stamped on every record.
    pub device_id: String,
    /// Root for local state (marker file, default artifact and log dirs).
    pub data_dir: PathBuf,
    /// Where captured photos are stored.
    pub artifact_dir: PathBuf,
    /// Where log files are written.
    pub log_dir: PathBuf,
    /// Master sync switch.
    pub sync_enabled: bool,
    /// Interval between queue drains.
    pub sync_interval: Duration,
    /// Outbox entries per drain.
    pub sync_batch_size: i64,
    /// Failed attempts before a record is abandoned.
    pub max_retries: i64,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Consecutive failures that open an endpoint breaker.
    pub breaker_failure_threshold: u32,
    /// How long an open breaker waits before a trial.
    pub breaker_reset_timeout: Duration,
    /// Concurrent half-open trials.
    pub breaker_half_open_trials: u32,
    /// Interval between connectivity probes.
    pub probe_interval: Duration,
    /// Free percentage at which captures are refused.
    pub disk_critical_percent: f64,
    /// Free percentage at which status warns.
    pub disk_warning_percent: f64,
    /// Maximum photo age.
    pub artifact_retention: Duration,
    /// Maximum log file age.
    pub log_retention: Duration,
    /// Cap on total photo bytes.
    pub max_artifact_bytes: u64,
    /// Interval between disk cleanups.
    pub cleanup_interval: Duration,
    /// Overall shutdown budget.
    pub shutdown_timeout: Duration,
    /// Per-component shutdown budget.
    pub component_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("backend_url", &self.backend_url)
            .field("api_key", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("data_dir", &self.data_dir)
            .field("artifact_dir", &self.artifact_dir)
            .field("log_dir", &self.log_dir)
            .field("sync_enabled", &self.sync_enabled)
            .field("sync_interval", &self.sync_interval)
            .field("sync_batch_size", &self.sync_batch_size)
            .field("max_retries", &self.max_retries)
            .field("probe_interval", &self.probe_interval)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ATTENDSYNC_BACKEND_URL`: backend REST base URL
    /// - `ATTENDSYNC_API_KEY`: bearer token
    ///
    /// Everything else has a default; see the crate docs for the full table.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_url = std::env::var("ATTENDSYNC_BACKEND_URL")
            .map_err(|_| ConfigError::Missing("ATTENDSYNC_BACKEND_URL"))?;
        if !(backend_url.starts_with("http://") || backend_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(
                "ATTENDSYNC_BACKEND_URL",
                "must start with http:// or https://",
            ));
        }

        let api_key = std::env::var("ATTENDSYNC_API_KEY")
            .map_err(|_| ConfigError::Missing("ATTENDSYNC_API_KEY"))?;

        let data_dir = PathBuf::from(var_or("ATTENDSYNC_DATA_DIR", ".data"));
        let database_path = std::env::var("ATTENDSYNC_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));
        let artifact_dir = std::env::var("ATTENDSYNC_ARTIFACT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("photos"));
        let log_dir = std::env::var("ATTENDSYNC_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("logs"));

        let disk_critical_percent: f64 = parse_var(
            "ATTENDSYNC_DISK_CRITICAL_PERCENT",
            5.0,
            "must be a percentage between 0 and 100",
        )?;
        let disk_warning_percent: f64 = parse_var(
            "ATTENDSYNC_DISK_WARNING_PERCENT",
            15.0,
            "must be a percentage between 0 and 100",
        )?;
        for (key, value) in [
            ("ATTENDSYNC_DISK_CRITICAL_PERCENT", disk_critical_percent),
            ("ATTENDSYNC_DISK_WARNING_PERCENT", disk_warning_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(key, "must be a percentage between 0 and 100"));
            }
        }

        Ok(Self {
            database_path,
            backend_url,
            api_key,
            device_id: var_or("ATTENDSYNC_DEVICE_ID", "kiosk-01"),
            data_dir,
            artifact_dir,
            log_dir,
            sync_enabled: parse_bool("ATTENDSYNC_SYNC_ENABLED", true)?,
            sync_interval: secs("ATTENDSYNC_SYNC_INTERVAL_SECS", 60)?,
            sync_batch_size: positive("ATTENDSYNC_SYNC_BATCH_SIZE", 50)? as i64,
            max_retries: positive("ATTENDSYNC_MAX_RETRIES", 5)? as i64,
            request_timeout: secs("ATTENDSYNC_REQUEST_TIMEOUT_SECS", 10)?,
            breaker_failure_threshold: positive("ATTENDSYNC_BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_reset_timeout: secs("ATTENDSYNC_BREAKER_RESET_TIMEOUT_SECS", 60)?,
            breaker_half_open_trials: positive("ATTENDSYNC_BREAKER_HALF_OPEN_TRIALS", 1)?,
            probe_interval: secs("ATTENDSYNC_PROBE_INTERVAL_SECS", 30)?,
            disk_critical_percent,
            disk_warning_percent,
            artifact_retention: Duration::from_secs(scaled(
                "ATTENDSYNC_ARTIFACT_RETENTION_DAYS",
                30,
                DAY,
                "must be a number of days",
            )?),
            log_retention: Duration::from_secs(scaled(
                "ATTENDSYNC_LOG_RETENTION_DAYS",
                7,
                DAY,
                "must be a number of days",
            )?),
            max_artifact_bytes: scaled(
                "ATTENDSYNC_MAX_ARTIFACT_MB",
                1024,
                MB,
                "must be a size in megabytes",
            )?,
            cleanup_interval: secs("ATTENDSYNC_CLEANUP_INTERVAL_SECS", 3600)?,
            shutdown_timeout: secs("ATTENDSYNC_SHUTDOWN_TIMEOUT_SECS", 30)?,
            component_timeout: secs("ATTENDSYNC_COMPONENT_TIMEOUT_SECS", 10)?,
        })
    }

    /// Orchestrator settings.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            enabled: self.sync_enabled,
            max_retries: self.max_retries,
            breaker: BreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                reset_timeout: self.breaker_reset_timeout,
                half_open_trials: self.breaker_half_open_trials,
            },
            online_wait: self.request_timeout,
            ..SyncConfig::default()
        }
    }

    /// HTTP backend settings.
    pub fn backend_config(&self) -> HttpBackendConfig {
        HttpBackendConfig {
            request_timeout: self.request_timeout,
            ..HttpBackendConfig::new(self.backend_url.clone(), self.api_key.clone())
        }
    }

    /// Disk monitor settings.
    pub fn disk_config(&self) -> DiskConfig {
        DiskConfig {
            data_dir: self.data_dir.clone(),
            artifact_dir: self.artifact_dir.clone(),
            log_dir: self.log_dir.clone(),
            critical_free_percent: self.disk_critical_percent,
            warning_free_percent: self.disk_warning_percent,
            artifact_retention: self.artifact_retention,
            log_retention: self.log_retention,
            max_artifact_bytes: self.max_artifact_bytes,
            cleanup_interval: self.cleanup_interval,
        }
    }

    /// Capture admission settings.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            artifact_dir: self.artifact_dir.clone(),
            ..CaptureConfig::default()
        }
    }

    /// Shutdown coordinator settings; the marker lives in the data dir.
    pub fn shutdown_config(&self) -> ShutdownConfig {
        ShutdownConfig {
            overall_timeout: self.shutdown_timeout,
            component_timeout: self.component_timeout,
            marker_path: Some(self.marker_path()),
        }
    }

    /// Location of the shutdown marker.
    pub fn marker_path(&self) -> PathBuf {
        self.data_dir.join("shutdown_marker.json")
    }

    /// Queue-drain worker settings.
    pub fn queue_drain_config(&self) -> QueueDrainWorkerConfig {
        QueueDrainWorkerConfig {
            poll_interval: self.sync_interval,
            batch_size: self.sync_batch_size,
            ..QueueDrainWorkerConfig::default()
        }
    }

    /// Disk-cleanup worker settings.
    pub fn disk_cleanup_config(&self) -> DiskCleanupWorkerConfig {
        DiskCleanupWorkerConfig {
            poll_interval: self.cleanup_interval,
        }
    }

    /// Connectivity probe settings.
    pub fn probe_config(&self) -> ConnectivityProbeConfig {
        ConnectivityProbeConfig {
            poll_interval: self.probe_interval,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(key: &'static str, default: T, hint: &'static str) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
    }
}

fn secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_var(key, default, "must be a number of seconds").map(Duration::from_secs)
}

fn scaled(key: &'static str, default: u64, unit: u64, hint: &'static str) -> Result<u64, ConfigError> {
    parse_var::<u64>(key, default, hint)?
        .checked_mul(unit)
        .ok_or(ConfigError::Invalid(key, hint))
}

fn positive(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    let value: u32 = parse_var(key, default, "must be a positive integer")?;
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be true or false")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
