//! Printer telemetry connection (Moonraker websocket).
//!
//! The controller only needs two things from the printer side: a way to
//! open a connection, and a way to pull the next text frame off it. Both are
//! traits so the controller can be driven by in-process fakes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::action::ConnectionState;
use crate::config::PrinterConfig;
use crate::error::TelemetryError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Name reported to Moonraker in `server.connection.identify`.
pub const CLIENT_NAME: &str = "printer-scene-bridge";

/// Opens telemetry connections. Called once at startup and again after
/// every drop.
pub trait TelemetryConnector: Send {
    type Connection: TelemetryConnection;

    /// Where connections go, for log messages.
    fn endpoint(&self) -> String;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, TelemetryError>> + Send;
}

/// One open telemetry connection.
pub trait TelemetryConnection: Send {
    /// Suspend until the next raw message.
    ///
    /// `None` means the connection ended cleanly; `Some(Err(_))` means it
    /// failed. Either way it must not be read again.
    fn next_message(&mut self) -> impl Future<Output = Option<Result<String, TelemetryError>>> + Send;

    /// Close the connection. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    fn state(&self) -> ConnectionState;
}

// ---------------------------------------------------------------------------
// Moonraker
// ---------------------------------------------------------------------------

/// Connects to Moonraker's `/websocket` endpoint.
pub struct MoonrakerConnector {
    config: PrinterConfig,
    next_id: AtomicU64,
}

impl MoonrakerConnector {
    pub fn new(config: PrinterConfig) -> Self {
        Self { config, next_id: AtomicU64::new(1) }
    }

    /// JSON-RPC request registering this bridge with Moonraker.
    pub fn identify_request(&self) -> serde_json::Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "server.connection.identify",
            "params": {
                "client_name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "type": "other",
                "url": env!("CARGO_PKG_REPOSITORY"),
            },
            "id": id,
        })
    }

    /// Endpoint without the token query, safe to log.
    fn redacted_url(&self) -> String {
        let url = self.config.url();
        url.split('?').next().unwrap_or(&url).to_string()
    }

    async fn open(&self) -> Result<WsStream, String> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.config.url().as_str())
            .await
            .map_err(|e| e.to_string())?;

        if self.config.identify {
            let request = self.identify_request().to_string();
            ws.send(Message::Text(request)).await.map_err(|e| e.to_string())?;
            debug!("sent Moonraker identify request");
        }
        Ok(ws)
    }
}

impl TelemetryConnector for MoonrakerConnector {
    type Connection = MoonrakerConnection;

    fn endpoint(&self) -> String {
        self.redacted_url()
    }

    async fn connect(&self) -> Result<MoonrakerConnection, TelemetryError> {
        let url = self.redacted_url();
        let opened = match tokio::time::timeout(self.config.connect_timeout, self.open()).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {} ms", self.config.connect_timeout.as_millis())),
        };
        match opened {
            Ok(socket) => {
                info!(url = %url, "connected to Moonraker");
                Ok(MoonrakerConnection { socket, state: ConnectionState::Connected })
            }
            Err(detail) => Err(TelemetryError::ConnectFailed { url, detail }),
        }
    }
}

/// An open Moonraker websocket.
pub struct MoonrakerConnection {
    socket: WsStream,
    state: ConnectionState,
}

impl TelemetryConnection for MoonrakerConnection {
    async fn next_message(&mut self) -> Option<Result<String, TelemetryError>> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(data))) => {
                    debug!(len = data.len(), "ignoring binary telemetry frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(reason = ?frame, "Moonraker closed the connection");
                    self.state = ConnectionState::Disconnected;
                    return None;
                }
                // Ping/Pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Moonraker connection error");
                    self.state = ConnectionState::Disconnected;
                    return Some(Err(TelemetryError::Transport(e.to_string())));
                }
                None => {
                    self.state = ConnectionState::Disconnected;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.state != ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            return;
        }
        self.state = ConnectionState::Closing;
        if let Err(e) = self.socket.close(None).await {
            debug!(error = %e, "Moonraker close handshake failed");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
