//! Configuration file support for itmd
//!
//! Loads and validates itmd configuration from TOML files.
//! Default location: /etc/itm/itmd.toml

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ItmError, ItmResult};
use crate::types::{MonitorProtocol, MonitoringConfig, TunnelKind, DEFAULT_MONITOR_INTERVAL_MS};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/itm/itmd.toml";

/// Default transport zone name.
pub const DEFAULT_ZONE_NAME: &str = "default-transport-zone";

/// Job coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum number of jobs executing at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retries after the first attempt for retryable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Deadline for a single attempt in milliseconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,

    /// Pause between attempts in milliseconds
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

/// Store access configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Deadline for every store operation in milliseconds
    #[serde(default = "default_store_timeout")]
    pub op_timeout_ms: u64,
}

/// Liveness monitoring defaults, used when a zone does not set its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringDefaults {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub protocol: MonitorProtocol,

    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u32,
}

/// VM migration handling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Upper bound on how long a migration guard stays registered
    #[serde(default = "default_guard_timeout")]
    pub guard_timeout_ms: u64,
}

/// Not-hosted VTEP parking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotHostedConfig {
    /// Drop parked VTEPs older than this; unset parks indefinitely
    #[serde(default)]
    pub ttl_secs: Option<u64>,

    /// Interval between expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Default transport zone configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultZoneConfig {
    /// Create the zone at startup if absent
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_zone_name")]
    pub name: String,

    #[serde(default)]
    pub tunnel_kind: TunnelKind,
}

/// Complete itmd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItmConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub monitoring: MonitoringDefaults,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub not_hosted: NotHostedConfig,

    #[serde(default)]
    pub default_zone: DefaultZoneConfig,
}

// Default functions
fn default_workers() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_task_timeout() -> u64 {
    5000
}

fn default_store_timeout() -> u64 {
    2000
}

fn default_monitor_interval() -> u32 {
    DEFAULT_MONITOR_INTERVAL_MS
}

fn default_guard_timeout() -> u64 {
    10_000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_zone_name() -> String {
    DEFAULT_ZONE_NAME.to_string()
}

// Default implementations
impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            task_timeout_ms: default_task_timeout(),
            retry_backoff_ms: 0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: default_store_timeout(),
        }
    }
}

impl Default for MonitoringDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            protocol: MonitorProtocol::Bfd,
            interval_ms: default_monitor_interval(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            guard_timeout_ms: default_guard_timeout(),
        }
    }
}

impl Default for NotHostedConfig {
    fn default() -> Self {
        Self {
            ttl_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for DefaultZoneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_zone_name(),
            tunnel_kind: TunnelKind::Vxlan,
        }
    }
}

impl CoordinatorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl MonitoringDefaults {
    pub fn params(&self) -> MonitoringConfig {
        MonitoringConfig {
            enabled: self.enabled,
            protocol: self.protocol,
            interval_ms: self.interval_ms,
        }
    }
}

impl ItmConfig {
    /// Load configuration from file.
    pub fn load(path: impl AsRef<Path>) -> ItmResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> ItmResult<Self> {
        let path = path.as_ref();
        match Self::load(path) {
            Err(ItmError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.op_timeout_ms)
    }

    pub fn guard_timeout(&self) -> Duration {
        Duration::from_millis(self.migration.guard_timeout_ms)
    }

    pub fn not_hosted_ttl(&self) -> Option<Duration> {
        self.not_hosted.ttl_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.not_hosted.sweep_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> ItmResult<()> {
        if self.coordinator.workers == 0 {
            return Err(ItmError::invalid_config(
                "coordinator.workers",
                "must be > 0",
            ));
        }
        if self.coordinator.task_timeout_ms == 0 {
            return Err(ItmError::invalid_config(
                "coordinator.task_timeout_ms",
                "must be > 0",
            ));
        }
        if self.store.op_timeout_ms == 0 {
            return Err(ItmError::invalid_config("store.op_timeout_ms", "must be > 0"));
        }
        if self.monitoring.interval_ms == 0 {
            return Err(ItmError::invalid_config(
                "monitoring.interval_ms",
                "must be > 0",
            ));
        }
        if self.migration.guard_timeout_ms == 0 {
            return Err(ItmError::invalid_config(
                "migration.guard_timeout_ms",
                "must be > 0",
            ));
        }
        if self.not_hosted.ttl_secs == Some(0) {
            return Err(ItmError::invalid_config(
                "not_hosted.ttl_secs",
                "must be > 0 when set",
            ));
        }
        if self.not_hosted.sweep_interval_secs == 0 {
            return Err(ItmError::invalid_config(
                "not_hosted.sweep_interval_secs",
                "must be > 0",
            ));
        }
        if self.default_zone.enabled && self.default_zone.name.is_empty() {
            return Err(ItmError::invalid_config(
                "default_zone.name",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ItmConfig::default();
        assert_eq!(config.coordinator.workers, 8);
        assert_eq!(config.coordinator.max_retries, 3);
        assert_eq!(config.coordinator.task_timeout(), Duration::from_secs(5));
        assert_eq!(config.store_timeout(), Duration::from_secs(2));
        assert_eq!(config.guard_timeout(), Duration::from_secs(10));
        assert_eq!(config.not_hosted_ttl(), None);
        assert_eq!(config.default_zone.name, "default-transport-zone");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization_partial() {
        let toml_str = r#"
[coordinator]
workers = 2

[monitoring]
enabled = true
protocol = "lldp"

[not_hosted]
ttl_secs = 300

[default_zone]
tunnel_kind = "gre"
"#;
        let config: ItmConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.coordinator.workers, 2);
        // Unspecified values should use defaults
        assert_eq!(config.coordinator.max_retries, 3);
        assert_eq!(
            config.monitoring.params(),
            MonitoringConfig {
                enabled: true,
                protocol: MonitorProtocol::Lldp,
                interval_ms: 1000,
            }
        );
        assert_eq!(config.not_hosted_ttl(), Some(Duration::from_secs(300)));
        assert_eq!(config.default_zone.tunnel_kind, TunnelKind::Gre);
        assert!(config.default_zone.enabled);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = ItmConfig::default();
        config.coordinator.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ItmError::InvalidConfig { ref field, .. }) if field == "coordinator.workers"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = ItmConfig::default();
        config.store.op_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ItmConfig::default();
        config.coordinator.task_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ItmConfig::default();
        config.not_hosted.ttl_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[coordinator]\nmax_retries = 5\n[store]\nop_timeout_ms = 250").unwrap();

        let config = ItmConfig::load(file.path()).unwrap();
        assert_eq!(config.coordinator.max_retries, 5);
        assert_eq!(config.store_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[coordinator]\nworkers = 0").unwrap();
        assert!(matches!(
            ItmConfig::load(file.path()),
            Err(ItmError::InvalidConfig { .. })
        ));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[coordinator\nworkers = ").unwrap();
        assert!(matches!(ItmConfig::load(file.path()), Err(ItmError::Toml(_))));
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = ItmConfig::load_or_default("/nonexistent/itmd.toml").unwrap();
        assert_eq!(config, ItmConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("itmd.toml");

        let mut config = ItmConfig::default();
        config.coordinator.workers = 3;
        config.not_hosted.ttl_secs = Some(120);
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(ItmConfig::load(&path).unwrap(), config);
    }
}
