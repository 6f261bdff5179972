//! Configuration loading and validation for the VIP controller

use crate::keepalived::{DemotionPolicy, Grouping, ManagerSettings, RenderOptions, SupervisorConfig};
use crate::host::HostSetup;
use crate::queue::QueueConfig;
use crate::resolver::ResolveOptions;
use crate::sync::SyncSettings;
use crate::watch::WatchSettings;
use ipvs::{ForwardingMethod, Scheduler};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

impl From<ConfigError> for common::Error {
    fn from(e: ConfigError) -> Self {
        common::Error::config(e)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub ipvs: IpvsSettings,

    #[serde(default)]
    pub keepalived: KeepalivedSettings,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub host: HostSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.controller.validate()?;
        self.queue.validate()?;
        self.ipvs.validate()?;
        self.keepalived.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

/// Controller-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerSettings {
    /// Name of this node; `--node-name` / `NODE_NAME` take precedence
    pub node_name: Option<String>,

    /// VIP map file, or directory of a mounted ConfigMap
    #[validate(length(min = 1))]
    pub vip_map: String,

    #[validate(range(min = 1, max = 256))]
    pub default_weight: u32,
}

/// Reconciliation queue timing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QueueSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_min_interval")]
    pub min_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_backoff")]
    pub backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_backoff")]
    pub backoff_cap: Duration,

    #[validate(range(min = 1, max = 1000))]
    pub max_retries: u32,
}

/// IPVS programming settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IpvsSettings {
    #[validate(length(min = 1, max = 15))]
    pub scheduler: String,

    /// nat, dr or tunnel
    #[validate(custom = "validate_forwarding")]
    pub forwarding: String,

    /// Client persistence; disabled when absent
    #[serde(with = "humantime_serde")]
    pub persistence_timeout: Option<Duration>,

    #[validate(range(max = 10))]
    pub op_retries: u32,

    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Bound on every netlink request
    #[serde(with = "humantime_serde")]
    pub netlink_timeout: Duration,

    pub demotion_policy: DemotionPolicy,
}

/// keepalived settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KeepalivedSettings {
    pub binary: PathBuf,
    pub config_path: PathBuf,

    #[validate(length(min = 1))]
    pub interface: String,

    #[validate(range(min = 1, max = 255))]
    pub vrid: u8,

    pub grouping: Grouping,
    pub use_unicast: bool,

    /// Priority of the first node in address order
    #[validate(range(min = 1, max = 254))]
    pub base_priority: u8,

    #[validate(range(min = 1, max = 255))]
    pub advert_int: u32,

    #[validate(length(min = 1))]
    pub instance_name: String,

    #[validate(custom = "validate_socket_path")]
    pub notify_socket: String,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    #[validate(range(min = 1, max = 100))]
    pub max_restarts: u32,

    #[serde(with = "humantime_serde")]
    pub restart_backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    pub restart_backoff_cap: Duration,
}

/// Watch scope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub namespace: Option<String>,
    pub node_selector: Option<String>,
}

/// Host preparation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub load_module: bool,
}

/// Metrics endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    #[validate(length(min = 1))]
    pub listen_addr: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            node_name: None,
            vip_map: "/etc/vip-controller/vips".to_string(),
            default_weight: 1,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        let q = QueueConfig::default();
        Self {
            min_interval: q.min_interval,
            backoff_base: q.backoff_base,
            backoff_cap: q.backoff_cap,
            max_retries: q.max_retries,
        }
    }
}

impl Default for IpvsSettings {
    fn default() -> Self {
        Self {
            scheduler: "wlc".to_string(),
            forwarding: "nat".to_string(),
            persistence_timeout: None,
            op_retries: 2,
            retry_delay: Duration::from_millis(50),
            netlink_timeout: Duration::from_secs(5),
            demotion_policy: DemotionPolicy::Retain,
        }
    }
}

impl Default for KeepalivedSettings {
    fn default() -> Self {
        let s = SupervisorConfig::default();
        Self {
            binary: PathBuf::from("/usr/sbin/keepalived"),
            config_path: PathBuf::from("/etc/keepalived/keepalived.conf"),
            interface: "eth0".to_string(),
            vrid: 50,
            grouping: Grouping::Single,
            use_unicast: false,
            base_priority: 100,
            advert_int: 1,
            instance_name: "vips".to_string(),
            notify_socket: "/run/vip-controller/notify.sock".to_string(),
            poll_interval: s.poll_interval,
            stop_timeout: s.stop_timeout,
            max_restarts: s.max_restarts,
            restart_backoff_base: s.restart_backoff_base,
            restart_backoff_cap: s.restart_backoff_cap,
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self { load_module: true }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9102".to_string(),
        }
    }
}

// Custom validators

fn validate_socket_path(path: &str) -> Result<(), ValidationError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("socket_path_empty"));
    }

    // Must be absolute path or relative (starting with ./)
    if !trimmed.starts_with('/') && !trimmed.starts_with("./") {
        return Err(ValidationError::new("socket_path_invalid_format"));
    }

    Ok(())
}

fn validate_min_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if millis > 60_000 {
        return Err(ValidationError::new("min_interval_out_of_range"));
    }
    Ok(())
}

fn validate_backoff(delay: &Duration) -> Result<(), ValidationError> {
    let millis = delay.as_millis();
    if !(10..=600_000).contains(&millis) {
        return Err(ValidationError::new("backoff_out_of_range"));
    }
    Ok(())
}

fn validate_forwarding(method: &str) -> Result<(), ValidationError> {
    parse_forwarding(method)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("forwarding_unknown"))
}

fn parse_forwarding(method: &str) -> Option<ForwardingMethod> {
    match method.to_ascii_lowercase().as_str() {
        "nat" | "masq" => Some(ForwardingMethod::Masq),
        "dr" | "route" => Some(ForwardingMethod::Route),
        "tun" | "tunnel" => Some(ForwardingMethod::Tunnel),
        _ => None,
    }
}

// Configuration loading implementation

impl Config {
    /// Load from `path` if given, else from the default search paths
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if !path.is_file() => Err(ConfigError::FileNotFound(path.to_path_buf())),
            Some(path) => Self::load_from_file(path),
            None => match Self::find_config_file() {
                Some(path) => {
                    tracing::info!("Loading configuration from: {}", path.display());
                    Self::load_from_file(&path)
                }
                None => {
                    tracing::info!("No configuration file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/vip-controller/config.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./vip-controller.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/vip-controller/config.yaml"))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            min_interval: self.queue.min_interval,
            backoff_base: self.queue.backoff_base,
            backoff_cap: self.queue.backoff_cap,
            max_retries: self.queue.max_retries,
        }
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            default_weight: self.controller.default_weight,
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        let scheduler = self
            .ipvs
            .scheduler
            .parse::<Scheduler>()
            .unwrap_or(Scheduler::WeightedLeastConnection);
        SyncSettings {
            scheduler,
            forwarding: parse_forwarding(&self.ipvs.forwarding).unwrap_or_default(),
            persistence_timeout: self.ipvs.persistence_timeout,
            op_retries: self.ipvs.op_retries,
            retry_delay: self.ipvs.retry_delay,
        }
    }

    /// keepalived settings; `notify_binary` is the executable keepalived
    /// runs on transitions.
    pub fn manager_settings(&self, notify_binary: &Path) -> ManagerSettings {
        let k = &self.keepalived;
        ManagerSettings {
            config_path: k.config_path.clone(),
            render: RenderOptions {
                interface: k.interface.clone(),
                vrid: k.vrid,
                grouping: k.grouping,
                use_unicast: k.use_unicast,
                advert_int: k.advert_int,
                instance_name: k.instance_name.clone(),
                notify_command: format!(
                    "{} notify --socket {}",
                    notify_binary.display(),
                    k.notify_socket
                ),
            },
            supervisor: SupervisorConfig {
                poll_interval: k.poll_interval,
                stop_timeout: k.stop_timeout,
                max_restarts: k.max_restarts,
                restart_backoff_base: k.restart_backoff_base,
                restart_backoff_cap: k.restart_backoff_cap,
            },
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            namespace: self.watch.namespace.clone(),
            node_selector: self.watch.node_selector.clone(),
        }
    }

    pub fn host_setup(&self) -> HostSetup {
        HostSetup {
            load_module: self.host.load_module,
            ..Default::default()
        }
    }
}
