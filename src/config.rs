//! Configuration file loading and validation.
//!
//! The TOML document is first deserialized into an all-optional raw shape so
//! that a missing key can be reported by name, then validated into the
//! immutable [`Config`] shared by every component for the process lifetime.
//!
//! ```toml
//! [printer]
//! host = "voron.local"
//! port = 7125
//!
//! [obs]
//! host = "localhost"
//! port = 4455
//! password = "secret"
//!
//! [scenes]
//! tool_change_started = "Toolhead"
//! tool_change_completed = "Printing"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::classifier::{Classifier, EventKind, DEFAULT_COMPLETE_TRIGGER, DEFAULT_START_TRIGGER};
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

/// Moonraker (telemetry) endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    /// Send `server.connection.identify` after the socket opens.
    pub identify: bool,
    pub connect_timeout: Duration,
}

impl PrinterConfig {
    /// Websocket URL, including the `token` query when one is configured.
    pub fn url(&self) -> String {
        match &self.token {
            Some(token) => format!("ws://{}:{}/websocket?token={}", self.host, self.port, token),
            None => format!("ws://{}:{}/websocket", self.host, self.port),
        }
    }
}

/// OBS (action) endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Warn at startup about mapped scenes OBS does not know.
    pub verify_scenes: bool,
    /// Start the OBS virtual camera after connecting if it is off.
    pub start_virtual_camera: bool,
}

impl ObsConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub tool_change_started: String,
    pub tool_change_completed: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tool_change_started: DEFAULT_START_TRIGGER.to_string(),
            tool_change_completed: DEFAULT_COMPLETE_TRIGGER.to_string(),
        }
    }
}

/// Telemetry reconnect delays.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Immutable process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub printer: PrinterConfig,
    pub obs: ObsConfig,
    /// Event → scene name. A kind absent from the map triggers nothing.
    pub scenes: BTreeMap<EventKind, String>,
    pub triggers: TriggerConfig,
    pub reconnect: ReconnectConfig,
    /// Normalized `tracing` level name.
    pub log_level: String,
    /// When false, events are classified and logged but never dispatched.
    pub auto_switch: bool,
}

impl Config {
    /// Read and validate the TOML file at `path`.
    ///
    /// # Errors
    /// - [`ConfigError::NotFound`] when the file does not exist.
    /// - [`ConfigError::Read`] for any other I/O failure.
    /// - [`ConfigError::Parse`] when the content is not valid TOML.
    /// - [`ConfigError::MissingKey`] / [`ConfigError::Invalid`] from validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound { path: path.to_path_buf() }
            } else {
                ConfigError::Read { path: path.to_path_buf(), source }
            }
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Parse and validate a TOML document. `origin` is only used in errors.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(origin),
            source,
        })?;
        raw.validate()
    }

    pub fn scene_for(&self, kind: EventKind) -> Option<&str> {
        self.scenes.get(&kind).map(String::as_str)
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::from_triggers(
            &self.triggers.tool_change_started,
            &self.triggers.tool_change_completed,
        )
    }
}

/// Map a user-supplied level name onto a `tracing` level.
///
/// Accepts the five `tracing` names plus the `warning` and `critical`
/// spellings, case-insensitively.
pub fn normalize_log_level(level: &str) -> Result<&'static str, ConfigError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "critical" => Ok("error"),
        other => Err(ConfigError::Invalid {
            field: "software.log_level".into(),
            reason: format!("unknown level '{other}'"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Raw (on-disk) shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    printer: Option<RawPrinter>,
    obs: Option<RawObs>,
    scenes: Option<BTreeMap<String, String>>,
    triggers: Option<RawTriggers>,
    reconnect: Option<RawReconnect>,
    software: Option<RawSoftware>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPrinter {
    host: Option<String>,
    port: Option<u16>,
    token: Option<String>,
    identify: Option<bool>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawObs {
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    verify_scenes: Option<bool>,
    start_virtual_camera: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTriggers {
    tool_change_started: Option<String>,
    tool_change_completed: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReconnect {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSoftware {
    log_level: Option<String>,
    auto_switch: Option<bool>,
}

const DEFAULT_TIMEOUT_MS: u64 = 5_000;

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.to_string(), reason: reason.into() }
}

fn required_host(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    let host = value.ok_or(ConfigError::MissingKey(key))?;
    let host = host.trim().to_string();
    if host.is_empty() {
        return Err(invalid(key, "must not be empty"));
    }
    Ok(host)
}

fn required_port(value: Option<u16>, key: &'static str) -> Result<u16, ConfigError> {
    match value {
        None => Err(ConfigError::MissingKey(key)),
        Some(0) => Err(invalid(key, "must be non-zero")),
        Some(port) => Ok(port),
    }
}

fn timeout(value: Option<u64>, key: &str) -> Result<Duration, ConfigError> {
    match value.unwrap_or(DEFAULT_TIMEOUT_MS) {
        0 => Err(invalid(key, "must be greater than zero")),
        ms => Ok(Duration::from_millis(ms)),
    }
}

/// Empty strings count as "not set" for optional secrets.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl RawConfig {
    fn validate(self) -> Result<Config, ConfigError> {
        let printer = self.printer.ok_or(ConfigError::MissingKey("printer"))?;
        let printer = PrinterConfig {
            host: required_host(printer.host, "printer.host")?,
            port: required_port(printer.port, "printer.port")?,
            token: non_empty(printer.token),
            identify: printer.identify.unwrap_or(true),
            connect_timeout: timeout(printer.connect_timeout_ms, "printer.connect_timeout_ms")?,
        };

        let obs = self.obs.ok_or(ConfigError::MissingKey("obs"))?;
        let obs = ObsConfig {
            host: required_host(obs.host, "obs.host")?,
            port: required_port(obs.port, "obs.port")?,
            password: non_empty(obs.password),
            connect_timeout: timeout(obs.connect_timeout_ms, "obs.connect_timeout_ms")?,
            request_timeout: timeout(obs.request_timeout_ms, "obs.request_timeout_ms")?,
            verify_scenes: obs.verify_scenes.unwrap_or(true),
            start_virtual_camera: obs.start_virtual_camera.unwrap_or(false),
        };

        let raw_scenes = self.scenes.ok_or(ConfigError::MissingKey("scenes"))?;
        if raw_scenes.is_empty() {
            return Err(invalid("scenes", "at least one event must map to a scene"));
        }
        let mut scenes = BTreeMap::new();
        for (key, scene) in raw_scenes {
            let kind = EventKind::from_key(&key)
                .ok_or_else(|| invalid(&format!("scenes.{key}"), "unknown event name"))?;
            if scene.trim().is_empty() {
                return Err(invalid(&format!("scenes.{key}"), "scene name must not be empty"));
            }
            scenes.insert(kind, scene);
        }

        let raw_triggers = self.triggers.unwrap_or_default();
        let defaults = TriggerConfig::default();
        let triggers = TriggerConfig {
            tool_change_started: raw_triggers
                .tool_change_started
                .unwrap_or(defaults.tool_change_started),
            tool_change_completed: raw_triggers
                .tool_change_completed
                .unwrap_or(defaults.tool_change_completed),
        };
        if triggers.tool_change_started.is_empty() {
            return Err(invalid("triggers.tool_change_started", "must not be empty"));
        }
        if triggers.tool_change_completed.is_empty() {
            return Err(invalid("triggers.tool_change_completed", "must not be empty"));
        }

        let raw_reconnect = self.reconnect.unwrap_or_default();
        let defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            initial_delay: raw_reconnect
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: raw_reconnect
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            multiplier: raw_reconnect.multiplier.unwrap_or(defaults.multiplier),
            jitter: raw_reconnect.jitter.unwrap_or(defaults.jitter),
        };
        if reconnect.initial_delay.is_zero() {
            return Err(invalid("reconnect.initial_delay_ms", "must be greater than zero"));
        }
        if reconnect.max_delay < reconnect.initial_delay {
            return Err(invalid("reconnect.max_delay_ms", "must be >= initial_delay_ms"));
        }
        if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
            return Err(invalid("reconnect.multiplier", "must be a finite number >= 1.0"));
        }

        let software = self.software.unwrap_or_default();
        let log_level = normalize_log_level(software.log_level.as_deref().unwrap_or("info"))?;

        Ok(Config {
            printer,
            obs,
            scenes,
            triggers,
            reconnect,
            log_level: log_level.to_string(),
            auto_switch: software.auto_switch.unwrap_or(true),
        })
    }
}
