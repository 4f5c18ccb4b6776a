//! Error taxonomy for the bridge.
//!
//! Only [`ConfigError`] and a startup [`ActionError::ConnectFailed`] are
//! fatal. Everything else is scoped to one message or one activation and is
//! logged by the caller, then dropped.

use std::path::PathBuf;

/// Problems loading or validating the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file '{}' not found", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read configuration file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required configuration key '{0}'")]
    MissingKey(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

/// Failures of the scene-control (OBS) connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("could not connect to {endpoint}: {detail}")]
    ConnectFailed { endpoint: String, detail: String },

    #[error("action endpoint is not connected")]
    NotConnected,

    #[error("'{action}' rejected by action endpoint (code {code}){}", comment.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    ActionRejected {
        action: String,
        code: i64,
        comment: Option<String>,
    },

    #[error("transport error: {0}")]
    TransportError(String),
}

/// Failures of the printer telemetry connection. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    #[error("could not connect to {url}: {detail}")]
    ConnectFailed { url: String, detail: String },

    #[error("telemetry connection error: {0}")]
    Transport(String),
}

/// A telemetry payload that is not valid JSON.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed telemetry message: {detail}")]
pub struct MalformedMessage {
    pub detail: String,
}

/// Errors that end [`crate::bridge::Bridge::run`] early.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("action endpoint unavailable at startup: {0}")]
    ActionConnect(#[source] ActionError),
}
