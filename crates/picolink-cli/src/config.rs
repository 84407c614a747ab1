//! Configuration – reads/writes `~/.picolink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use picolink_hal::SerialSettings;
use picolink_middleware::MqttConfig;
use picolink_types::DeviceProtocol;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Persisted settings shared by the `bridge` and `web` commands.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    #[serde(default = "default_keepalive_secs")]
    pub mqtt_keepalive_secs: u64,

    /// Base client id.  A random id is generated per process when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_username: Option<String>,

    /// Broker password (stored as plain text – the file is written 0600).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_password: Option<String>,

    #[serde(default = "default_command_topic")]
    pub command_topic: String,

    #[serde(default = "default_log_topic")]
    pub log_topic: String,

    #[serde(default = "default_serial_port")]
    pub serial_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Lines kept by the web console's log buffer.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Device menu revision the web console encodes commands for.
    #[serde(default)]
    pub protocol: DeviceProtocol,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Print device output on the bridge's stdout.
    #[serde(default = "default_echo")]
    pub echo_device_output: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("mqtt_host", &self.mqtt_host)
            .field("mqtt_port", &self.mqtt_port)
            .field("mqtt_keepalive_secs", &self.mqtt_keepalive_secs)
            .field("mqtt_client_id", &self.mqtt_client_id)
            .field(
                "mqtt_username",
                if self.mqtt_username.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field(
                "mqtt_password",
                if self.mqtt_password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("command_topic", &self.command_topic)
            .field("log_topic", &self.log_topic)
            .field("serial_port", &self.serial_port)
            .field("baud_rate", &self.baud_rate)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("reconnect_backoff_ms", &self.reconnect_backoff_ms)
            .field("log_capacity", &self.log_capacity)
            .field("protocol", &self.protocol)
            .field("http_port", &self.http_port)
            .field("echo_device_output", &self.echo_device_output)
            .finish()
    }
}

fn default_mqtt_host() -> String {
    "test.mosquitto.org".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_keepalive_secs() -> u64 {
    60
}
fn default_command_topic() -> String {
    "pico/cmd".to_string()
}
fn default_log_topic() -> String {
    "pico/log".to_string()
}
fn default_serial_port() -> String {
    "/dev/ttyACM0".to_string()
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_reconnect_backoff_ms() -> u64 {
    2000
}
fn default_log_capacity() -> usize {
    500
}
fn default_http_port() -> u16 {
    5000
}
fn default_echo() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_keepalive_secs: default_keepalive_secs(),
            mqtt_client_id: None,
            mqtt_username: None,
            mqtt_password: None,
            command_topic: default_command_topic(),
            log_topic: default_log_topic(),
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            log_capacity: default_log_capacity(),
            protocol: DeviceProtocol::default(),
            http_port: default_http_port(),
            echo_device_output: default_echo(),
        }
    }
}

impl Config {
    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.mqtt_host.trim().is_empty() {
            return invalid("mqtt_host must not be empty");
        }
        if self.mqtt_port == 0 {
            return invalid("mqtt_port must be non-zero");
        }
        if self.mqtt_keepalive_secs == 0 {
            return invalid("mqtt_keepalive_secs must be at least 1");
        }
        if self.command_topic.trim().is_empty() || self.log_topic.trim().is_empty() {
            return invalid("command_topic and log_topic must not be empty");
        }
        if self.command_topic == self.log_topic {
            return invalid("command_topic and log_topic must differ");
        }
        if self.serial_port.trim().is_empty() {
            return invalid("serial_port must not be empty");
        }
        if self.baud_rate == 0 {
            return invalid("baud_rate must be non-zero");
        }
        if self.read_timeout_ms == 0 || self.reconnect_backoff_ms == 0 {
            return invalid("read_timeout_ms and reconnect_backoff_ms must be non-zero");
        }
        if self.log_capacity == 0 {
            return invalid("log_capacity must be non-zero");
        }
        Ok(())
    }

    /// Broker settings for one process.  `role` keeps the bridge and the web
    /// console from sharing a client id, which the broker would treat as a
    /// takeover.
    pub fn mqtt_config(&self, role: &str) -> MqttConfig {
        let client_id = match &self.mqtt_client_id {
            Some(base) => format!("{base}-{role}"),
            None => MqttConfig::generated_client_id(),
        };
        MqttConfig {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            keep_alive: Duration::from_secs(self.mqtt_keepalive_secs),
            client_id,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            reconnect_delay: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.serial_port.clone(),
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }

    /// TOML rendering with credentials masked, for display.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.mqtt_password.is_some() {
            shown.mqtt_password = Some("<redacted>".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

/// Return the path to `~/.picolink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".picolink").join("config.toml")
}

/// Load the file at `path`.  Returns `None` if it does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(cfg))
}

/// File (or defaults) + `PICOLINK_*` overrides, validated.
pub fn load_effective(path: &Path) -> Result<Config, ConfigError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Apply `PICOLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PICOLINK_MQTT_HOST` | `mqtt_host` |
/// | `PICOLINK_MQTT_PORT` | `mqtt_port` |
/// | `PICOLINK_MQTT_KEEPALIVE_SECS` | `mqtt_keepalive_secs` |
/// | `PICOLINK_MQTT_CLIENT_ID` | `mqtt_client_id` |
/// | `PICOLINK_MQTT_USERNAME` | `mqtt_username` |
/// | `PICOLINK_MQTT_PASSWORD` | `mqtt_password` |
/// | `PICOLINK_COMMAND_TOPIC` | `command_topic` |
/// | `PICOLINK_LOG_TOPIC` | `log_topic` |
/// | `PICOLINK_SERIAL_PORT` | `serial_port` |
/// | `PICOLINK_BAUD_RATE` | `baud_rate` |
/// | `PICOLINK_READ_TIMEOUT_MS` | `read_timeout_ms` |
/// | `PICOLINK_RECONNECT_BACKOFF_MS` | `reconnect_backoff_ms` |
/// | `PICOLINK_LOG_CAPACITY` | `log_capacity` |
/// | `PICOLINK_PROTOCOL` | `protocol` |
/// | `PICOLINK_HTTP_PORT` | `http_port` |
/// | `PICOLINK_ECHO_DEVICE_OUTPUT` | `echo_device_output` |
///
/// Unparseable values are ignored with a warning.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str, field: &mut T) {
        if let Some(raw) = lookup(name) {
            match raw.trim().parse() {
                Ok(value) => *field = value,
                Err(_) => warn!(variable = name, value = %raw, "ignoring unparseable override"),
            }
        }
    }

    let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
    if let Some(v) = lookup("PICOLINK_MQTT_HOST") {
        cfg.mqtt_host = v;
    }
    parsed(lookup, "PICOLINK_MQTT_PORT", &mut cfg.mqtt_port);
    parsed(lookup, "PICOLINK_MQTT_KEEPALIVE_SECS", &mut cfg.mqtt_keepalive_secs);
    if let Some(v) = lookup("PICOLINK_MQTT_CLIENT_ID") {
        cfg.mqtt_client_id = Some(v);
    }
    if let Some(v) = lookup("PICOLINK_MQTT_USERNAME") {
        cfg.mqtt_username = Some(v);
    }
    if let Some(v) = lookup("PICOLINK_MQTT_PASSWORD") {
        cfg.mqtt_password = Some(v);
    }
    if let Some(v) = lookup("PICOLINK_COMMAND_TOPIC") {
        cfg.command_topic = v;
    }
    if let Some(v) = lookup("PICOLINK_LOG_TOPIC") {
        cfg.log_topic = v;
    }
    if let Some(v) = lookup("PICOLINK_SERIAL_PORT") {
        cfg.serial_port = v;
    }
    parsed(lookup, "PICOLINK_BAUD_RATE", &mut cfg.baud_rate);
    parsed(lookup, "PICOLINK_READ_TIMEOUT_MS", &mut cfg.read_timeout_ms);
    parsed(lookup, "PICOLINK_RECONNECT_BACKOFF_MS", &mut cfg.reconnect_backoff_ms);
    parsed(lookup, "PICOLINK_LOG_CAPACITY", &mut cfg.log_capacity);
    parsed(lookup, "PICOLINK_PROTOCOL", &mut cfg.protocol);
    parsed(lookup, "PICOLINK_HTTP_PORT", &mut cfg.http_port);
    parsed(lookup, "PICOLINK_ECHO_DEVICE_OUTPUT", &mut cfg.echo_device_output);
}

/// Write `cfg` to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

/// Write a default config file unless one already exists (or `force`).
pub fn init_at(path: &Path, force: bool) -> Result<Config, ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    let cfg = Config::default();
    save_to(&cfg, path)?;
    Ok(cfg)
}
