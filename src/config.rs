//! Kernel configuration: HTTP bind, device transport and scheduler settings.
//!
//! Loaded from a YAML file pointed at by `ATO_KERNEL_CONFIG` (default
//! `kernel.yaml`); a missing or invalid file falls back to defaults so the
//! kernel always comes up.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub http_port: u16,
    pub transport: TransportConf,
    pub scheduler: SchedulerConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http_port: 5000,
            transport: TransportConf::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConf {
    /// Base URL of the management REST API the kernel polls devices through.
    pub base_url: String,
}

impl Default for TransportConf {
    fn default() -> Self {
        Self { base_url: "http://127.0.0.1:9090/api".into() }
    }
}

/// Scheduler settings. The mutable subset (interval, concurrency cap,
/// auto-discovery) is read by the driver at each tick boundary; changes take
/// effect on the next tick, never retroactively.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub polling_interval_secs: u64,
    pub max_concurrent_devices: usize,
    pub auto_discovery_enabled: bool,
    /// Backoff ceiling as a multiple of the base interval.
    pub backoff_cap_multiplier: u32,
    /// Aggregation window for top-talkers ranking.
    pub window_secs: u64,
    /// Deadline for a single poll round-trip.
    pub poll_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 60,
            max_concurrent_devices: 10,
            auto_discovery_enabled: true,
            backoff_cap_multiplier: 8,
            window_secs: 300,
            poll_timeout_secs: 5,
        }
    }
}

/// Validates a polling interval coming from the control surface.
pub fn validate_polling_interval(seconds: i64) -> Result<u64, ConfigError> {
    if seconds <= 0 {
        return Err(ConfigError::InvalidConfig(format!(
            "polling interval must be positive, got {seconds}"
        )));
    }
    Ok(seconds as u64)
}

/// Validates a concurrency cap coming from the control surface.
pub fn validate_max_concurrent(n: i64) -> Result<usize, ConfigError> {
    if n < 1 {
        return Err(ConfigError::InvalidConfig(format!(
            "max concurrent devices must be >= 1, got {n}"
        )));
    }
    Ok(n as usize)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("ATO_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("invalid config {path}: {e}, using defaults");
            KernelConfig::default()
        })
    } else {
        warn!("no {path}, using default config");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_interval() {
        assert!(validate_polling_interval(-5).is_err());
        assert!(validate_polling_interval(0).is_err());
        assert_eq!(validate_polling_interval(10).unwrap(), 10);
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(validate_max_concurrent(0).is_err());
        assert!(validate_max_concurrent(-3).is_err());
        assert_eq!(validate_max_concurrent(1).unwrap(), 1);
    }

    #[test]
    fn empty_yaml_gives_defaults() {
        let cfg: KernelConfig = serde_yaml::from_str("http_port: 8080").unwrap();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.scheduler.polling_interval_secs, 60);
        assert_eq!(cfg.scheduler.max_concurrent_devices, 10);
        assert!(cfg.scheduler.auto_discovery_enabled);
    }

    #[test]
    fn partial_scheduler_section_keeps_other_defaults() {
        let cfg: KernelConfig =
            serde_yaml::from_str("scheduler:\n  polling_interval_secs: 15\n").unwrap();
        assert_eq!(cfg.scheduler.polling_interval_secs, 15);
        assert_eq!(cfg.scheduler.backoff_cap_multiplier, 8);
        assert_eq!(cfg.scheduler.window_secs, 300);
    }

    #[tokio::test]
    async fn load_config_reads_the_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.yaml");
        std::fs::write(&path, "http_port: 6060\nscheduler:\n  max_concurrent_devices: 3\n")
            .unwrap();
        std::env::set_var("ATO_KERNEL_CONFIG", &path);

        let cfg = load_config().await;
        assert_eq!(cfg.http_port, 6060);
        assert_eq!(cfg.scheduler.max_concurrent_devices, 3);

        std::env::remove_var("ATO_KERNEL_CONFIG");
    }
}
