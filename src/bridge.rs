//! # Bridge controller
//!
//! Owns both connections and drives the state machine:
//!
//! ```text
//! Starting ──► Connecting ──► Running ◄──► Reconnecting
//!                  │             │              │
//!                  └─────────────┴──────────────┴──► Stopping ──► Stopped
//! ```
//!
//! ## What It Does
//!
//! 1. Connects the action client first. Failure here is fatal.
//! 2. Opens the telemetry connection, retrying with backoff until it works or
//!    shutdown is requested.
//! 3. For every telemetry message: classify, look up the mapped scene for
//!    each event, and activate it before reading the next message.
//! 4. When telemetry drops, reconnects it with backoff. The action connection
//!    is left alone.
//! 5. On shutdown, closes both connections within a bounded window. A
//!    connect or activation still in flight is abandoned.
//!
//! A failed activation or a malformed message is logged and counted; it never
//! changes state and never stops the loop.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let bridge = Bridge::new(Arc::new(config), obs, moonraker);
//! let report = bridge.run(shutdown_rx).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::action::{ActionClient, ConnectionState};
use crate::backoff::Backoff;
use crate::classifier::{Classifier, Event};
use crate::config::Config;
use crate::error::{BridgeError, ConfigError};
use crate::telemetry::{TelemetryConnection, TelemetryConnector};

/// Upper bound for closing each connection during shutdown.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Connecting,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeState::Starting => write!(f, "Starting"),
            BridgeState::Connecting => write!(f, "Connecting"),
            BridgeState::Running => write!(f, "Running"),
            BridgeState::Reconnecting => write!(f, "Reconnecting"),
            BridgeState::Stopping => write!(f, "Stopping"),
            BridgeState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Counters accumulated over one [`Bridge::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub messages: u64,
    pub malformed: u64,
    pub events: u64,
    pub activations_ok: u64,
    pub activations_failed: u64,
    pub reconnects: u64,
}

/// What a completed run looked like.
#[derive(Debug, Clone)]
pub struct BridgeReport {
    /// Every state entered, in order, starting with `Starting`.
    pub transitions: Vec<BridgeState>,
    pub stats: BridgeStats,
}

impl BridgeReport {
    pub fn final_state(&self) -> BridgeState {
        self.transitions.last().copied().unwrap_or(BridgeState::Starting)
    }
}

/// The event bridge. Generic over both connections so it can be driven by
/// fakes in tests.
pub struct Bridge<A: ActionClient, T: TelemetryConnector> {
    config: Arc<Config>,
    action: A,
    telemetry: T,
    classifier: Classifier,
    backoff: Backoff,
    state: BridgeState,
    transitions: Vec<BridgeState>,
    stats: BridgeStats,
}

impl<A: ActionClient, T: TelemetryConnector> Bridge<A, T> {
    pub fn new(config: Arc<Config>, action: A, telemetry: T) -> Self {
        let classifier = config.classifier();
        let backoff = Backoff::new(config.reconnect.clone());
        Self {
            config,
            action,
            telemetry,
            classifier,
            backoff,
            state: BridgeState::Starting,
            transitions: vec![BridgeState::Starting],
            stats: BridgeStats::default(),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped).
    ///
    /// # Returns
    /// - `Ok(report)` after a graceful shutdown, from any state.
    /// - `Err(BridgeError::Config)` when the configuration maps no events.
    /// - `Err(BridgeError::ActionConnect)` when the action endpoint cannot be
    ///   reached at startup.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<BridgeReport, BridgeError> {
        if self.config.scenes.is_empty() {
            return Err(ConfigError::Invalid {
                field: "scenes".into(),
                reason: "at least one event must map to a scene".into(),
            }
            .into());
        }
        self.transition(BridgeState::Connecting);

        let connected = tokio::select! {
            result = self.action.connect() => Some(result),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };
        match connected {
            None => return Ok(self.stop(None).await),
            Some(Err(e)) => {
                error!(error = %e, "cannot reach action endpoint at startup");
                self.stop(None).await;
                return Err(BridgeError::ActionConnect(e));
            }
            Some(Ok(())) => {}
        }

        if self.config.obs.verify_scenes {
            self.verify_actions().await;
        }

        let Some(mut connection) = self.open_telemetry(&mut shutdown, false).await else {
            return Ok(self.stop(None).await);
        };
        self.transition(BridgeState::Running);

        loop {
            let next = tokio::select! {
                message = connection.next_message() => Some(message),
                _ = wait_for_shutdown(&mut shutdown) => None,
            };

            match next {
                None => break,
                Some(Some(Ok(raw))) => {
                    // Dispatch may reconnect the action client; shutdown abandons it.
                    let handled = tokio::select! {
                        _ = self.handle_message(&raw) => true,
                        _ = wait_for_shutdown(&mut shutdown) => false,
                    };
                    if !handled {
                        break;
                    }
                    continue;
                }
                Some(Some(Err(e))) => warn!(error = %e, "telemetry connection failed"),
                Some(None) => warn!("telemetry connection closed"),
            }

            connection.close().await;
            self.transition(BridgeState::Reconnecting);
            self.stats.reconnects += 1;
            match self.open_telemetry(&mut shutdown, true).await {
                Some(reopened) => {
                    connection = reopened;
                    self.transition(BridgeState::Running);
                }
                None => return Ok(self.stop(None).await),
            }
        }

        Ok(self.stop(Some(connection)).await)
    }

    /// Classify one raw message and dispatch its events in order.
    pub async fn handle_message(&mut self, raw: &str) {
        self.stats.messages += 1;
        // A message proves the connection is healthy again.
        self.backoff.reset();

        let events = match self.classifier.classify(raw) {
            Ok(events) => events,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, "skipping telemetry message");
                return;
            }
        };

        for event in events {
            self.stats.events += 1;
            self.dispatch(event).await;
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let kind = event.kind;
        let Some(scene) = self.config.scene_for(kind) else {
            debug!(event = %kind, "no scene mapped for event");
            return;
        };
        info!(event = %kind, scene, "tool change detected");

        if !self.config.auto_switch {
            info!(event = %kind, scene, "auto-switch disabled, scene not changed");
            return;
        }

        if self.action.state() != ConnectionState::Connected {
            warn!(state = %self.action.state(), "action endpoint not connected, reconnecting");
            if let Err(e) = self.action.connect().await {
                self.stats.activations_failed += 1;
                error!(error = %e, event = %kind, scene, "dropping scene change");
                return;
            }
        }

        match self.action.activate(scene).await {
            Ok(()) => {
                self.stats.activations_ok += 1;
                info!(event = %kind, scene, "scene switched");
            }
            Err(e) => {
                self.stats.activations_failed += 1;
                error!(error = %e, event = %kind, scene, "scene switch failed");
            }
        }
    }

    /// Warn about mapped scenes the action endpoint does not know.
    async fn verify_actions(&mut self) {
        match self.action.available_actions().await {
            Ok(available) => {
                info!(count = available.len(), "action endpoint scenes loaded");
                for scene in self.config.scenes.values() {
                    if !available.iter().any(|a| a == scene) {
                        warn!(scene = %scene, "mapped scene not found on action endpoint");
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not list scenes on action endpoint"),
        }
    }

    /// Open the telemetry connection, retrying with backoff.
    ///
    /// With `delay_first` the first attempt also waits, so a printer that
    /// accepts and immediately drops connections is not hammered.
    /// Returns `None` when shutdown was requested first.
    async fn open_telemetry(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        delay_first: bool,
    ) -> Option<T::Connection> {
        let endpoint = self.telemetry.endpoint();
        let mut wait = delay_first;
        loop {
            if wait {
                let delay = self.backoff.next_delay();
                debug!(url = %endpoint, delay_ms = delay.as_millis() as u64, "waiting before telemetry connect");
                let slept = tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = wait_for_shutdown(shutdown) => false,
                };
                if !slept {
                    return None;
                }
            }
            wait = true;

            info!(url = %endpoint, "connecting to telemetry endpoint");
            let attempt = tokio::select! {
                result = self.telemetry.connect() => Some(result),
                _ = wait_for_shutdown(shutdown) => None,
            };
            match attempt? {
                Ok(connection) => return Some(connection),
                Err(e) => warn!(
                    error = %e,
                    attempt = self.backoff.attempts() + 1,
                    "telemetry connect failed, will retry"
                ),
            }
        }
    }

    /// Close everything and finish in `Stopped`. Never fails.
    async fn stop(mut self, connection: Option<T::Connection>) -> BridgeReport {
        self.transition(BridgeState::Stopping);

        if let Some(mut connection) = connection {
            if tokio::time::timeout(TEARDOWN_TIMEOUT, connection.close()).await.is_err() {
                warn!("telemetry close timed out");
            }
        }
        if tokio::time::timeout(TEARDOWN_TIMEOUT, self.action.disconnect()).await.is_err() {
            warn!("action endpoint disconnect timed out");
        }

        self.transition(BridgeState::Stopped);
        info!(
            messages = self.stats.messages,
            events = self.stats.events,
            activations_ok = self.stats.activations_ok,
            activations_failed = self.stats.activations_failed,
            reconnects = self.stats.reconnects,
            "bridge stopped"
        );
        BridgeReport { transitions: self.transitions, stats: self.stats }
    }

    fn transition(&mut self, next: BridgeState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "bridge state change");
        }
        self.state = next;
        self.transitions.push(next);
    }
}

/// Resolve once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
