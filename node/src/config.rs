use anyhow::Result;
use serde::Deserialize;

/// Application configuration loaded from a TOML file or defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Filesystem layout of the node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Where backup workers place result databases.
    #[serde(default = "default_results_dir")]
    pub results_dir: String,

    /// Where per-experiment database metadata cache files live.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Where the registry store and legacy config files live.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
}

fn default_results_dir() -> String {
    "/scopenode_data/results".into()
}

fn default_cache_dir() -> String {
    "/scopenode_data/cache".into()
}

fn default_config_dir() -> String {
    "/etc/scopenode".into()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            cache_dir: default_cache_dir(),
            config_dir: default_config_dir(),
        }
    }
}

/// Device discovery and polling cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Seconds between polls of a reachable device.
    #[serde(default = "default_refresh_period")]
    pub refresh_period_secs: f64,

    /// Slower cadence applied while a device reports `busy`.
    #[serde(default = "default_busy_refresh_period")]
    pub busy_refresh_period_secs: f64,

    /// HTTP port the devices listen on.
    #[serde(default = "default_device_port")]
    pub device_port: u16,

    /// TCP port devices publish their frame stream on.
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,

    /// HTTP timeout for device requests, seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: f64,

    /// Generic errors tolerated before the device latches `skip_scanning`.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Seconds between backup-status recomputations per device.
    #[serde(default = "default_db_update_interval")]
    pub db_update_interval_secs: f64,
}

fn default_refresh_period() -> f64 {
    5.0
}

fn default_busy_refresh_period() -> f64 {
    60.0
}

fn default_device_port() -> u16 {
    9000
}

fn default_stream_port() -> u16 {
    8887
}

fn default_http_timeout() -> f64 {
    5.0
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_db_update_interval() -> f64 {
    30.0
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            refresh_period_secs: default_refresh_period(),
            busy_refresh_period_secs: default_busy_refresh_period(),
            device_port: default_device_port(),
            stream_port: default_stream_port(),
            http_timeout_secs: default_http_timeout(),
            max_consecutive_errors: default_max_consecutive_errors(),
            db_update_interval_secs: default_db_update_interval(),
        }
    }
}

/// Alerting thresholds and suppression windows.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Minutes an unreached device may stay silent before going offline.
    #[serde(default = "default_unreachable_timeout")]
    pub unreachable_timeout_minutes: f64,

    /// Shorter allowance for devices that still answer `/id` but not their
    /// data endpoint.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_minutes: f64,

    /// Window after a poweroff/reboot/restart during which a disappearance
    /// counts as graceful.
    #[serde(default = "default_graceful_grace")]
    pub graceful_shutdown_grace_minutes: f64,

    /// Window after any user instruction during which a stop counts as
    /// user-triggered.
    #[serde(default = "default_user_action_timeout")]
    pub user_action_timeout_seconds: f64,

    /// Disk usage percentage at which a storage warning fires.
    #[serde(default = "default_storage_threshold")]
    pub storage_warning_threshold: f64,

    /// Optional webhook to receive alert payloads.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_unreachable_timeout() -> f64 {
    20.0
}

fn default_busy_timeout() -> f64 {
    10.0
}

fn default_graceful_grace() -> f64 {
    5.0
}

fn default_user_action_timeout() -> f64 {
    30.0
}

fn default_storage_threshold() -> f64 {
    80.0
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            unreachable_timeout_minutes: default_unreachable_timeout(),
            busy_timeout_minutes: default_busy_timeout(),
            graceful_shutdown_grace_minutes: default_graceful_grace(),
            user_action_timeout_seconds: default_user_action_timeout(),
            storage_warning_threshold: default_storage_threshold(),
            webhook_url: None,
        }
    }
}

/// Registry cleanup thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Days without contact before a device record is retired.
    #[serde(default = "default_retire_days")]
    pub retire_after_days: u64,

    /// Hours a registry row may stay busy/unreached before being forced
    /// offline.
    #[serde(default = "default_stale_status_hours")]
    pub stale_status_hours: u64,
}

fn default_retire_days() -> u64 {
    90
}

fn default_stale_status_hours() -> u64 {
    2
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retire_after_days: default_retire_days(),
            stale_status_hours: default_stale_status_hours(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::de::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scanner.refresh_period_secs, 5.0);
        assert_eq!(config.scanner.busy_refresh_period_secs, 60.0);
        assert_eq!(config.scanner.device_port, 9000);
        assert_eq!(config.scanner.max_consecutive_errors, 10);
        assert_eq!(config.alerts.unreachable_timeout_minutes, 20.0);
        assert_eq!(config.alerts.busy_timeout_minutes, 10.0);
        assert_eq!(config.alerts.user_action_timeout_seconds, 30.0);
        assert_eq!(config.retention.retire_after_days, 90);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::de::from_str(
            r#"
            [scanner]
            refresh_period_secs = 0.5

            [alerts]
            unreachable_timeout_minutes = 5.0
            "#,
        )
        .unwrap();
        assert_eq!(config.scanner.refresh_period_secs, 0.5);
        assert_eq!(config.scanner.device_port, 9000);
        assert_eq!(config.alerts.unreachable_timeout_minutes, 5.0);
        assert_eq!(config.alerts.busy_timeout_minutes, 10.0);
    }
}
