//! Bridges Klipper tool-change notifications from Moonraker to OBS scene
//! switches.
//!
//! The [`bridge::Bridge`] controller owns one [`telemetry`] connection and
//! one [`action`] client, runs every inbound message through the
//! [`classifier`], and activates the scene the [`config`] maps each event to.

pub mod action;
pub mod backoff;
pub mod bridge;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod obs;
pub mod telemetry;

pub use action::{ActionClient, ConnectionState};
pub use bridge::{Bridge, BridgeReport, BridgeState, BridgeStats};
pub use classifier::{Classifier, Event, EventKind};
pub use config::Config;
pub use error::{ActionError, BridgeError, ConfigError, MalformedMessage, TelemetryError};
pub use obs::ObsClient;
pub use telemetry::{MoonrakerConnector, TelemetryConnection, TelemetryConnector};
