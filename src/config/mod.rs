// Configuration Management Module
// Handles medic.toml loading, defaults, and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Main home-medic configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedicConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Fleet-wide detector defaults; instances may override the whole section
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub healing: HealingConfig,

    #[serde(default)]
    pub cascade: CascadeConfig,

    #[serde(default)]
    pub websocket: WebsocketConfig,

    #[serde(default)]
    pub rest: RestConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

/// One monitored controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,

    /// Base URL, e.g. http://homeassistant.local:8123
    pub url: String,

    /// Long-lived access token
    pub token: String,

    /// Directory holding core.entity_registry and core.config_entries
    #[serde(default)]
    pub registry_path: Option<PathBuf>,

    /// Subscribe to the realtime event stream; otherwise only reconcile
    #[serde(default = "default_true")]
    pub realtime: bool,

    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// How long a classified issue must persist before it is reported
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Age after which an entity counts as stale; 0 disables staleness
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,

    /// Glob patterns of monitored entity ids; empty means all
    #[serde(default)]
    pub include: Vec<String>,

    /// Glob patterns never monitored; wins over include
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Per-entity grace periods in seconds
    #[serde(default)]
    pub grace_overrides: BTreeMap<String, u64>,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Capacity of each pipeline channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Full bookkeeping without calling the controller
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Consecutive failures that open a target's breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_circuit_reset")]
    pub circuit_reset_secs: u64,

    #[serde(default = "default_remediation_timeout")]
    pub remediation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Route detected issues through the cascade instead of a bare reload
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub entity_level: bool,

    #[serde(default = "default_true")]
    pub device_level: bool,

    #[serde(default = "default_true")]
    pub integration_level: bool,

    /// Wait before confirming an entity or device action from the cache; 0 checks the controller at once
    #[serde(default)]
    pub verify_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Idle time before probing the connection with a ping
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,

    /// Also subscribe to call_service and refresh discovery on reloads
    #[serde(default = "default_true")]
    pub discovery_refresh: bool,

    #[serde(default = "default_refresh_interval")]
    pub discovery_refresh_min_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_rest_timeout")]
    pub timeout_secs: u64,

    /// Transport failures are retried this many times
    #[serde(default = "default_rest_retries")]
    pub max_retries: u32,

    #[serde(default = "default_rest_retry_base")]
    pub retry_base_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Persistent notification on the affected controller
    PersistentNotification,
    /// Log line only
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sink")]
    pub sink: SinkKind,
}

// Default value functions
fn default_log_level() -> String { "home_medic=info".to_string() }
fn default_log_format() -> LogFormat { LogFormat::Json }
fn default_db_path() -> PathBuf { PathBuf::from("medic.db") }
fn default_grace_period() -> u64 { 300 }
fn default_stale_threshold() -> u64 { 3600 }
fn default_sweep_interval() -> u64 { 30 }
fn default_reconcile_interval() -> u64 { 300 }
fn default_channel_capacity() -> usize { 1024 }
fn default_cooldown() -> u64 { 300 }
fn default_failure_threshold() -> u32 { 5 }
fn default_circuit_reset() -> u64 { 1800 }
fn default_remediation_timeout() -> u64 { 30 }
fn default_reconnect_base() -> u64 { 1000 }
fn default_reconnect_max_delay() -> u64 { 300_000 }
fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_handshake_timeout() -> u64 { 10 }
fn default_receive_timeout() -> u64 { 60 }
fn default_refresh_interval() -> u64 { 60 }
fn default_rest_timeout() -> u64 { 10 }
fn default_rest_retries() -> u32 { 3 }
fn default_rest_retry_base() -> u64 { 500 }
fn default_sink() -> SinkKind { SinkKind::PersistentNotification }
fn default_true() -> bool { true }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            stale_threshold_secs: default_stale_threshold(),
            include: Vec::new(),
            exclude: Vec::new(),
            grace_overrides: BTreeMap::new(),
            sweep_interval_secs: default_sweep_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            dry_run: false,
            cooldown_secs: default_cooldown(),
            failure_threshold: default_failure_threshold(),
            circuit_reset_secs: default_circuit_reset(),
            remediation_timeout_secs: default_remediation_timeout(),
        }
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            entity_level: default_true(),
            device_level: default_true(),
            integration_level: default_true(),
            verify_delay_ms: 0,
        }
    }
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            handshake_timeout_secs: default_handshake_timeout(),
            receive_timeout_secs: default_receive_timeout(),
            discovery_refresh: default_true(),
            discovery_refresh_min_interval_secs: default_refresh_interval(),
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_rest_timeout(),
            max_retries: default_rest_retries(),
            retry_base_ms: default_rest_retry_base(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sink: default_sink(),
        }
    }
}

impl MonitoringConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

impl HealingConfig {
    pub fn remediation_timeout(&self) -> Duration {
        Duration::from_secs(self.remediation_timeout_secs)
    }
}

impl WebsocketConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

impl InstanceConfig {
    /// Per-instance monitoring section, falling back to the fleet default
    pub fn monitoring_or<'a>(&'a self, fleet: &'a MonitoringConfig) -> &'a MonitoringConfig {
        self.monitoring.as_ref().unwrap_or(fleet)
    }
}

impl MedicConfig {
    /// Load configuration from file or use defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let contents = std::fs::read_to_string(path)
                .context("Failed to read configuration file")?;

            let config: MedicConfig = toml::from_str(&contents)
                .context("Failed to parse configuration file")?;

            config.validate()?;
            Ok(config)
        } else {
            warn!("Configuration file not found, using defaults");
            info!("Create medic.toml to add monitored instances");
            Ok(Self::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for instance in &self.instances {
            if instance.id.trim().is_empty() {
                anyhow::bail!("Instance id cannot be empty");
            }
            if !seen.insert(instance.id.as_str()) {
                anyhow::bail!("Duplicate instance id '{}'", instance.id);
            }
            if !(instance.url.starts_with("http://") || instance.url.starts_with("https://")) {
                anyhow::bail!("Instance '{}' url must start with http:// or https://", instance.id);
            }
            if instance.token.trim().is_empty() {
                anyhow::bail!("Instance '{}' has no access token", instance.id);
            }
            if let Some(monitoring) = &instance.monitoring {
                validate_monitoring(monitoring)
                    .with_context(|| format!("Instance '{}' monitoring section", instance.id))?;
            }
        }

        validate_monitoring(&self.monitoring)?;

        if self.healing.failure_threshold == 0 {
            anyhow::bail!("Failure threshold must be at least 1");
        }

        if self.healing.remediation_timeout_secs == 0 {
            anyhow::bail!("Remediation timeout must be at least 1 second");
        }

        if self.websocket.reconnect_base_ms == 0 {
            anyhow::bail!("Reconnect base delay cannot be 0");
        }

        if self.websocket.handshake_timeout_secs == 0 || self.websocket.receive_timeout_secs == 0 {
            anyhow::bail!("Websocket timeouts must be at least 1 second");
        }

        if self.rest.timeout_secs == 0 {
            anyhow::bail!("REST timeout must be at least 1 second");
        }

        Ok(())
    }

    /// Validation for commands that run the control loop
    pub fn validate_for_start(&self) -> Result<()> {
        self.validate()?;
        if self.instances.is_empty() {
            anyhow::bail!("No [[instances]] configured; nothing to monitor");
        }
        Ok(())
    }
}

fn validate_monitoring(monitoring: &MonitoringConfig) -> Result<()> {
    for pattern in monitoring.include.iter().chain(monitoring.exclude.iter()) {
        glob::Pattern::new(pattern)
            .with_context(|| format!("Invalid entity pattern '{}'", pattern))?;
    }

    if monitoring.channel_capacity == 0 {
        anyhow::bail!("Channel capacity must be at least 1");
    }

    Ok(())
}
