//! obs-websocket v5 client implementing [`ActionClient`].

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{self, op, Hello, Identified, Identify, Request, RequestResponse};
use crate::action::{ActionClient, ConnectionState};
use crate::config::ObsConfig;
use crate::error::ActionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SET_PROGRAM_SCENE: &str = "SetCurrentProgramScene";
pub const GET_SCENE_LIST: &str = "GetSceneList";
pub const GET_VIRTUAL_CAM_STATUS: &str = "GetVirtualCamStatus";
pub const START_VIRTUAL_CAM: &str = "StartVirtualCam";

/// Timeouts in a row after which the socket is treated as dead.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Connection to an OBS Studio websocket server.
///
/// Construct with [`ObsClient::new`], then [`connect`](ActionClient::connect)
/// before issuing any request.
pub struct ObsClient {
    config: ObsConfig,
    socket: Option<WsStream>,
    state: ConnectionState,
    consecutive_timeouts: u32,
}

impl ObsClient {
    pub fn new(config: ObsConfig) -> Self {
        Self { config, socket: None, state: ConnectionState::Disconnected, consecutive_timeouts: 0 }
    }

    pub fn config(&self) -> &ObsConfig {
        &self.config
    }

    /// Open the socket and run Hello → Identify → Identified.
    async fn handshake(&self) -> Result<WsStream, String> {
        let url = self.config.url();
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| e.to_string())?;

        let hello: Hello = read_op(&mut ws, op::HELLO).await?;
        debug!(
            obs_version = hello.obs_web_socket_version.as_deref().unwrap_or("unknown"),
            rpc_version = hello.rpc_version,
            auth_required = hello.authentication.is_some(),
            "OBS hello received"
        );

        let authentication = match (&hello.authentication, &self.config.password) {
            (Some(auth), Some(password)) => {
                Some(protocol::auth_string(password, &auth.salt, &auth.challenge))
            }
            (Some(_), None) => {
                return Err("server requires a password but none is configured".into());
            }
            (None, _) => None,
        };

        let identify = Identify {
            rpc_version: protocol::RPC_VERSION,
            authentication,
            event_subscriptions: 0,
        };
        let text = protocol::encode(op::IDENTIFY, &identify).map_err(|e| e.to_string())?;
        ws.send(Message::Text(text)).await.map_err(|e| e.to_string())?;

        let identified: Identified = read_op(&mut ws, op::IDENTIFIED).await?;
        debug!(rpc_version = identified.negotiated_rpc_version, "OBS identified");
        Ok(ws)
    }

    /// Send one request and wait for its response.
    ///
    /// # Returns
    /// - `Ok(response)` whatever `requestStatus.result` says; callers decide
    ///   what a failed status means.
    /// - `Err(NotConnected)` when no handshake has completed.
    /// - `Err(TransportError)` when the socket fails, closes, or the response
    ///   does not arrive within `request_timeout`. A failed or closed socket,
    ///   or [`MAX_CONSECUTIVE_TIMEOUTS`] timeouts in a row, also drop the
    ///   client to `Disconnected`.
    pub async fn call(
        &mut self,
        request_type: &str,
        request_data: Option<serde_json::Value>,
    ) -> Result<RequestResponse, ActionError> {
        if self.state != ConnectionState::Connected {
            return Err(ActionError::NotConnected);
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(ActionError::NotConnected);
        };

        let request = Request::new(request_type, request_data);
        let text = protocol::encode(op::REQUEST, &request)
            .map_err(|e| ActionError::TransportError(e.to_string()))?;

        let exchange = async {
            socket.send(Message::Text(text)).await.map_err(|e| e.to_string())?;
            wait_for_response(socket, &request.request_id).await
        };
        let outcome = tokio::time::timeout(self.config.request_timeout, exchange).await;

        match outcome {
            Ok(Ok(response)) => {
                self.consecutive_timeouts = 0;
                Ok(response)
            }
            Ok(Err(detail)) => {
                warn!(request = request_type, error = %detail, "OBS connection lost");
                self.socket = None;
                self.state = ConnectionState::Disconnected;
                Err(ActionError::TransportError(detail))
            }
            Err(_) => {
                self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
                if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    warn!(
                        request = request_type,
                        consecutive_timeouts = self.consecutive_timeouts,
                        "OBS stopped answering, dropping connection"
                    );
                    self.socket = None;
                    self.state = ConnectionState::Disconnected;
                }
                Err(ActionError::TransportError(format!(
                    "{request_type} timed out after {} ms",
                    self.config.request_timeout.as_millis()
                )))
            }
        }
    }

    /// Start the virtual camera when it is not already running. Log-only.
    async fn ensure_virtual_camera(&mut self) {
        let active = match self.call(GET_VIRTUAL_CAM_STATUS, None).await {
            Ok(resp) if resp.request_status.result => resp
                .response_data
                .as_ref()
                .and_then(|d| d.get("outputActive"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            Ok(resp) => {
                warn!(code = resp.request_status.code, "could not query OBS virtual camera");
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not query OBS virtual camera");
                return;
            }
        };
        if active {
            debug!("OBS virtual camera already active");
            return;
        }

        info!("OBS virtual camera is not active, starting it");
        match self.call(START_VIRTUAL_CAM, None).await {
            Ok(resp) if resp.request_status.result => info!("OBS virtual camera started"),
            Ok(resp) => warn!(
                code = resp.request_status.code,
                comment = resp.request_status.comment.as_deref().unwrap_or(""),
                "failed to start OBS virtual camera"
            ),
            Err(e) => warn!(error = %e, "failed to start OBS virtual camera"),
        }
    }
}

impl ActionClient for ObsClient {
    async fn connect(&mut self) -> Result<(), ActionError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        let endpoint = self.config.url();
        self.state = ConnectionState::Connecting;
        info!(endpoint = %endpoint, "connecting to OBS");

        let result = match tokio::time::timeout(self.config.connect_timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {} ms", self.config.connect_timeout.as_millis())),
        };

        match result {
            Ok(ws) => {
                self.socket = Some(ws);
                self.state = ConnectionState::Connected;
                self.consecutive_timeouts = 0;
                info!(endpoint = %endpoint, "connected to OBS");
            }
            Err(detail) => {
                self.state = ConnectionState::Disconnected;
                return Err(ActionError::ConnectFailed { endpoint, detail });
            }
        }

        if self.config.start_virtual_camera {
            self.ensure_virtual_camera().await;
        }
        Ok(())
    }

    async fn activate(&mut self, action: &str) -> Result<(), ActionError> {
        let data = serde_json::json!({ "sceneName": action });
        let response = self.call(SET_PROGRAM_SCENE, Some(data)).await?;
        if response.request_status.result {
            Ok(())
        } else {
            Err(ActionError::ActionRejected {
                action: action.to_string(),
                code: response.request_status.code,
                comment: response.request_status.comment,
            })
        }
    }

    async fn available_actions(&mut self) -> Result<Vec<String>, ActionError> {
        let response = self.call(GET_SCENE_LIST, None).await?;
        if !response.request_status.result {
            return Err(ActionError::ActionRejected {
                action: GET_SCENE_LIST.to_string(),
                code: response.request_status.code,
                comment: response.request_status.comment,
            });
        }
        Ok(scene_names(response.response_data.as_ref()))
    }

    async fn disconnect(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            self.state = ConnectionState::Disconnected;
            return;
        };
        self.state = ConnectionState::Closing;
        if let Err(e) = socket.close(None).await {
            debug!(error = %e, "OBS close handshake failed");
        }
        self.state = ConnectionState::Disconnected;
        info!("disconnected from OBS");
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Read frames until the response carrying `request_id` arrives.
async fn wait_for_response(socket: &mut WsStream, request_id: &str) -> Result<RequestResponse, String> {
    loop {
        let text = next_text(socket).await?;
        let envelope = match protocol::decode(&text) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "skipping undecodable OBS frame");
                continue;
            }
        };
        if envelope.op == op::EVENT {
            debug!("skipping OBS event");
            continue;
        }
        if envelope.op != op::REQUEST_RESPONSE {
            continue;
        }
        match serde_json::from_value::<RequestResponse>(envelope.d) {
            Ok(resp) if resp.request_id == request_id => return Ok(resp),
            Ok(resp) => debug!(request_id = %resp.request_id, "skipping stale OBS response"),
            Err(e) => debug!(error = %e, "skipping undecodable OBS response"),
        }
    }
}

/// Read frames until one with opcode `expected` arrives and decode its payload.
async fn read_op<T: DeserializeOwned>(socket: &mut WsStream, expected: u8) -> Result<T, String> {
    loop {
        let text = next_text(socket).await?;
        let envelope = protocol::decode(&text).map_err(|e| e.to_string())?;
        if envelope.op == expected {
            return serde_json::from_value(envelope.d).map_err(|e| e.to_string());
        }
        debug!(op = envelope.op, expected, "skipping OBS frame during handshake");
    }
}

/// Next text frame, or a description of why the socket is unusable.
async fn next_text(socket: &mut WsStream) -> Result<String, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(frame))) => {
                return Err(match frame {
                    Some(frame) => {
                        let code = u16::from(frame.code);
                        let meaning = protocol::describe_close_code(code).unwrap_or("closed");
                        if frame.reason.is_empty() {
                            format!("connection closed by OBS ({code}: {meaning})")
                        } else {
                            format!("connection closed by OBS ({code}: {meaning}): {}", frame.reason)
                        }
                    }
                    None => "connection closed by OBS".to_string(),
                });
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("connection closed".to_string()),
        }
    }
}

/// Extract `scenes[].sceneName` from a `GetSceneList` response.
fn scene_names(data: Option<&serde_json::Value>) -> Vec<String> {
    data.and_then(|d| d.get("scenes"))
        .and_then(|s| s.as_array())
        .map(|scenes| {
            scenes
                .iter()
                .filter_map(|s| s.get("sceneName").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
