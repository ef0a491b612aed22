//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::PositionMethod;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "zone-counter".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic filter the inference pipeline publishes frame detections to
    #[serde(default = "default_detections_topic")]
    pub detections_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_detections_topic() -> String {
    "zone-counter/detections/#".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            detections_topic: default_detections_topic(),
            username: None,
            password: None,
        }
    }
}

/// Tuning for the zone occupancy state machine
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CountingConfig {
    /// Pixels the zone is shrunk by on each side before containment tests
    #[serde(default = "default_zone_padding")]
    zone_padding: u32,
    /// Consecutive consistent frames before a containment signal is trusted
    #[serde(default = "default_stability_threshold")]
    stability_threshold: u32,
    /// Seconds inside before an entry counts
    #[serde(default = "default_min_dwell_secs")]
    min_dwell_secs: f64,
    /// Seconds outside before an exit is confirmed
    #[serde(default = "default_exit_grace_secs")]
    exit_grace_secs: f64,
    /// Debounce entries not updated for this long are reaped
    #[serde(default = "default_debounce_stale_secs")]
    debounce_stale_secs: f64,
    /// Dwell records without activity for this long are reaped
    #[serde(default = "default_dwell_stale_secs")]
    dwell_stale_secs: f64,
    /// How a bounding box is reduced to a point
    #[serde(default)]
    position_method: PositionMethod,
}

fn default_zone_padding() -> u32 {
    30
}

fn default_stability_threshold() -> u32 {
    3
}

fn default_min_dwell_secs() -> f64 {
    1.0
}

fn default_exit_grace_secs() -> f64 {
    1.0
}

fn default_debounce_stale_secs() -> f64 {
    30.0
}

fn default_dwell_stale_secs() -> f64 {
    120.0
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            zone_padding: default_zone_padding(),
            stability_threshold: default_stability_threshold(),
            min_dwell_secs: default_min_dwell_secs(),
            exit_grace_secs: default_exit_grace_secs(),
            debounce_stale_secs: default_debounce_stale_secs(),
            dwell_stale_secs: default_dwell_stale_secs(),
            position_method: PositionMethod::default(),
        }
    }
}

impl CountingConfig {
    #[inline]
    pub fn zone_padding(&self) -> u32 {
        self.zone_padding
    }

    #[inline]
    pub fn stability_threshold(&self) -> u32 {
        self.stability_threshold
    }

    #[inline]
    pub fn min_dwell_secs(&self) -> f64 {
        self.min_dwell_secs
    }

    #[inline]
    pub fn exit_grace_secs(&self) -> f64 {
        self.exit_grace_secs
    }

    #[inline]
    pub fn debounce_stale_secs(&self) -> f64 {
        self.debounce_stale_secs
    }

    #[inline]
    pub fn dwell_stale_secs(&self) -> f64 {
        self.dwell_stale_secs
    }

    #[inline]
    pub fn position_method(&self) -> PositionMethod {
        self.position_method
    }

    /// Reject non-positive thresholds and windows
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stability_threshold == 0 {
            bail!("counting.stability_threshold must be > 0");
        }
        let windows = [
            ("counting.min_dwell_secs", self.min_dwell_secs),
            ("counting.exit_grace_secs", self.exit_grace_secs),
            ("counting.debounce_stale_secs", self.debounce_stale_secs),
            ("counting.dwell_stale_secs", self.dwell_stale_secs),
        ];
        for (name, value) in windows {
            if !value.is_finite() || value <= 0.0 {
                bail!("{name} must be a positive number of seconds, got {value}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot file (zones, counts, history)
    #[serde(default = "default_store_file")]
    pub file: String,
    /// Minimum time between two snapshot writes
    #[serde(default = "default_store_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_store_file() -> String {
    "zones.json".to_string()
}

fn default_store_flush_interval_ms() -> u64 {
    1000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { file: default_store_file(), flush_interval_ms: default_store_flush_interval_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// HTTP API port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_port() -> u16 {
    5000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_http_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an embedded MQTT broker for the inference pipeline to publish to
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_broker_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Enable MQTT egress publishing
    #[serde(default = "default_mqtt_egress_enabled")]
    pub enabled: bool,
    /// Topic for qualified entries / confirmed exits (QoS 0)
    #[serde(default = "default_events_topic")]
    pub events_topic: String,
    /// Topic for the retained full snapshot (QoS 1)
    #[serde(default = "default_snapshot_topic")]
    pub snapshot_topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    /// Minimum time between two snapshot publishes
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    /// Interval for publishing metrics (seconds)
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

fn default_mqtt_egress_enabled() -> bool {
    true
}

fn default_events_topic() -> String {
    "zone-counter/events".to_string()
}

fn default_snapshot_topic() -> String {
    "zone-counter/snapshot".to_string()
}

fn default_metrics_topic() -> String {
    "zone-counter/metrics".to_string()
}

fn default_snapshot_interval_ms() -> u64 {
    500
}

fn default_metrics_publish_interval() -> u64 {
    5
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_mqtt_egress_enabled(),
            events_topic: default_events_topic(),
            snapshot_topic: default_snapshot_topic(),
            metrics_topic: default_metrics_topic(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    site: SiteConfig,
    #[serde(default)]
    mqtt: MqttConfig,
    #[serde(default)]
    counting: CountingConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    http: HttpConfig,
    #[serde(default)]
    broker: BrokerConfig,
    #[serde(default)]
    mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_detections_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    counting: CountingConfig,
    store_file: String,
    store_flush_interval_ms: u64,
    http_port: u16,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    metrics_interval_secs: u64,
    config_file: String,
    // MQTT Egress config
    mqtt_egress_enabled: bool,
    mqtt_egress_events_topic: String,
    mqtt_egress_snapshot_topic: String,
    mqtt_egress_metrics_topic: String,
    mqtt_egress_snapshot_interval_ms: u64,
    mqtt_egress_metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_detections_topic: toml_config.mqtt.detections_topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            counting: toml_config.counting,
            store_file: toml_config.store.file,
            store_flush_interval_ms: toml_config.store.flush_interval_ms,
            http_port: toml_config.http.port,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_events_topic: toml_config.mqtt_egress.events_topic,
            mqtt_egress_snapshot_topic: toml_config.mqtt_egress.snapshot_topic,
            mqtt_egress_metrics_topic: toml_config.mqtt_egress.metrics_topic,
            mqtt_egress_snapshot_interval_ms: toml_config.mqtt_egress.snapshot_interval_ms,
            mqtt_egress_metrics_interval_secs: toml_config.mqtt_egress.metrics_publish_interval_secs,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        toml_config
            .counting
            .validate()
            .with_context(|| format!("Invalid counting section in {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a specific path, falling back to defaults
    pub fn load_from_path(config_path: &str) -> Self {
        match Self::from_file(config_path) {
            Ok(config) => {
                info!(config_file = %config_path, "config_loaded_from_file");
                config
            }
            Err(e) => {
                warn!(config_file = %config_path, error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_detections_topic(&self) -> &str {
        &self.mqtt_detections_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn counting(&self) -> &CountingConfig {
        &self.counting
    }

    pub fn store_file(&self) -> &str {
        &self.store_file
    }

    pub fn store_flush_interval_ms(&self) -> u64 {
        self.store_flush_interval_ms
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // MQTT Egress getters
    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_events_topic(&self) -> &str {
        &self.mqtt_egress_events_topic
    }

    pub fn mqtt_egress_snapshot_topic(&self) -> &str {
        &self.mqtt_egress_snapshot_topic
    }

    pub fn mqtt_egress_metrics_topic(&self) -> &str {
        &self.mqtt_egress_metrics_topic
    }

    pub fn mqtt_egress_snapshot_interval_ms(&self) -> u64 {
        self.mqtt_egress_snapshot_interval_ms
    }

    pub fn mqtt_egress_metrics_interval_secs(&self) -> u64 {
        self.mqtt_egress_metrics_interval_secs
    }

    /// Builder method for tests to override the counting section
    #[cfg(test)]
    pub fn with_counting(mut self, counting: CountingConfig) -> Self {
        self.counting = counting;
        self
    }

    /// Builder method for tests to point the store somewhere else
    #[cfg(test)]
    pub fn with_store_file(mut self, file: &str) -> Self {
        self.store_file = file.to_string();
        self
    }
}
