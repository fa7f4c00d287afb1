//! TOML config file loading, with environment-variable overrides for the
//! settings most often tweaked per-deployment.

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "alarm-engine".to_string()
}
fn default_subscribe_topic() -> String {
    "sensors/+/data".to_string()
}
fn default_alarm_topic() -> String {
    "alarms/notifications".to_string()
}
fn default_store_path() -> String {
    "sqlite:alarm-engine.db?mode=rwc".to_string()
}
fn default_max_workers() -> usize {
    20
}
fn default_intake_capacity() -> usize {
    500
}
fn default_check_interval_seconds() -> u64 {
    60
}
fn default_retention_days() -> i64 {
    30
}
fn default_shunt_freshness_seconds() -> f64 {
    120.0
}
fn default_logging_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub store: StoreConfig,
    pub processing: ProcessingConfig,
    pub defaults: DefaultsConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            store: StoreConfig::default(),
            processing: ProcessingConfig::default(),
            defaults: DefaultsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub broker: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_subscribe_topic")]
    pub subscribe_topic: String,
    #[serde(default = "default_alarm_topic")]
    pub alarm_topic: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1".to_string(),
            port: default_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            subscribe_topic: default_subscribe_topic(),
            alarm_topic: default_alarm_topic(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            intake_capacity: default_intake_capacity(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_shunt_freshness_seconds")]
    pub shunt_freshness_seconds: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            shunt_freshness_seconds: default_shunt_freshness_seconds(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_level")]
    pub level: String,
    pub file: Option<String>,
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_logging_level(),
            file: None,
            format: None,
        }
    }
}

/// Read and parse a TOML config file. A missing file is not an error — the
/// service runs on defaults, tuned entirely by environment variables.
pub fn load(path: &str) -> Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e).with_context(|| format!("failed to read config: {path}")),
    }
}

/// Apply environment-variable overrides on top of a loaded config, matching
/// the teacher's `MQTT_HOST`/`MQTT_PORT`/`DB_URL` override pattern.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(broker) = std::env::var("MQTT_HOST") {
        config.transport.broker = broker;
    }
    if let Ok(port) = std::env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        config.transport.port = port;
    }
    if let (Ok(user), Ok(pass)) = (std::env::var("MQTT_USER"), std::env::var("MQTT_PASS")) {
        config.transport.username = Some(user);
        config.transport.password = Some(pass);
    }
    if let Ok(db_url) = std::env::var("DB_URL") {
        config.store.path = db_url;
    }
    if let Ok(level) = std::env::var("RUST_LOG") {
        config.logging.level = level;
    }
}
