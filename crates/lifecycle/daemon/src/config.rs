//! Configuration for lifecycle-daemon

use lifecycle_engine::{EngineConfig, RequeueIntervals, DEFAULT_REMOTE_NAMESPACE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Requeue intervals
    #[serde(default)]
    pub requeue: RequeueConfig,

    /// Runtime cluster settings
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Maintenance window policy
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Controller loop settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Requeue intervals in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueConfig {
    /// After a pass that ended `Ready`
    #[serde(default = "default_success_secs")]
    pub success_secs: u64,

    /// While modules are still processing or deleting
    #[serde(default = "default_busy_secs")]
    pub busy_secs: u64,

    /// After a pass that ended in `Error`
    #[serde(default = "default_error_secs")]
    pub error_secs: u64,

    /// After a pass that ended in `Warning`
    #[serde(default = "default_warning_secs")]
    pub warning_secs: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            success_secs: default_success_secs(),
            busy_secs: default_busy_secs(),
            error_secs: default_error_secs(),
            warning_secs: default_warning_secs(),
        }
    }
}

impl RequeueConfig {
    pub fn intervals(&self) -> RequeueIntervals {
        RequeueIntervals {
            success: Duration::from_secs(self.success_secs),
            busy: Duration::from_secs(self.busy_secs),
            error: Duration::from_secs(self.error_secs),
            warning: Duration::from_secs(self.warning_secs),
        }
    }
}

/// Runtime cluster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Install manifests into runtime clusters instead of the control plane
    #[serde(default)]
    pub in_kcp_mode: bool,

    /// Namespace for default custom resources in the runtime cluster
    #[serde(default = "default_sync_namespace")]
    pub sync_namespace: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            in_kcp_mode: false,
            sync_namespace: default_sync_namespace(),
        }
    }
}

/// Maintenance window policy location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Directory holding policy files
    #[serde(default = "default_policy_dir")]
    pub policy_dir: PathBuf,

    /// Policy file name without extension, empty disables maintenance windows
    #[serde(default)]
    pub policy_name: String,

    /// Minimum length of an ongoing window
    #[serde(default = "default_min_window_minutes")]
    pub min_window_minutes: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            policy_dir: default_policy_dir(),
            policy_name: String::new(),
            min_window_minutes: default_min_window_minutes(),
        }
    }
}

impl MaintenanceConfig {
    pub fn enabled(&self) -> bool {
        !self.policy_name.is_empty()
    }

    pub fn min_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.min_window_minutes)
    }
}

/// Controller loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Namespace whose Kymas are reconciled
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Kymas reconciled in parallel
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reconciles: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_concurrent_reconciles: default_max_concurrent(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_success_secs() -> u64 {
    30
}

fn default_busy_secs() -> u64 {
    5
}

fn default_error_secs() -> u64 {
    2
}

fn default_warning_secs() -> u64 {
    30
}

fn default_sync_namespace() -> String {
    DEFAULT_REMOTE_NAMESPACE.to_string()
}

fn default_policy_dir() -> PathBuf {
    PathBuf::from("/etc/maintenance-policy")
}

fn default_min_window_minutes() -> i64 {
    20
}

fn default_namespace() -> String {
    "kcp-system".to_string()
}

fn default_max_concurrent() -> u16 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LifecycleConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&LifecycleConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Environment variables, e.g. LIFECYCLE_REQUEUE__SUCCESS_SECS
        builder = builder.add_source(
            config::Environment::with_prefix("LIFECYCLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            in_kcp_mode: self.remote.in_kcp_mode,
            remote_sync_namespace: self.remote.sync_namespace.clone(),
            intervals: self.requeue.intervals(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = LifecycleConfig::default();
        assert!(!config.remote.in_kcp_mode);
        assert_eq!(config.remote.sync_namespace, "kyma-system");
        assert_eq!(config.controller.namespace, "kcp-system");
        assert_eq!(config.controller.max_concurrent_reconciles, 1);
        assert!(!config.maintenance.enabled());
    }

    #[test]
    fn test_requeue_defaults() {
        let intervals = RequeueConfig::default().intervals();
        assert_eq!(intervals, RequeueIntervals::default());
        assert_eq!(intervals.error, Duration::from_secs(2));
    }

    #[test]
    fn test_engine_config_follows_remote_section() {
        let mut config = LifecycleConfig::default();
        config.remote.in_kcp_mode = true;
        config.remote.sync_namespace = "kyma-runtime".to_string();
        config.requeue.busy_secs = 7;

        let engine = config.engine_config();
        assert!(engine.in_kcp_mode);
        assert_eq!(engine.remote_sync_namespace, "kyma-runtime");
        assert_eq!(engine.intervals.busy, Duration::from_secs(7));
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "remote:\n  in_kcp_mode: true\nmaintenance:\n  policy_name: policy\n  min_window_minutes: 45\n"
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let config = LifecycleConfig::load(Some(&path)).unwrap();

        assert!(config.remote.in_kcp_mode);
        assert_eq!(config.remote.sync_namespace, "kyma-system");
        assert!(config.maintenance.enabled());
        assert_eq!(config.maintenance.min_window(), chrono::Duration::minutes(45));
        assert_eq!(config.requeue.success_secs, 30);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = LifecycleConfig::load(Some("/nonexistent/lifecycle")).unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }
}
