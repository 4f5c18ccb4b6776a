//! obs-websocket v5 wire types.
//!
//! Every frame is `{ "op": <u8>, "d": { ... } }`. Only the handshake and
//! request/response opcodes are modelled; the bridge identifies with
//! `eventSubscriptions = 0`, so OBS should never push events, but any that do
//! arrive are skipped by the client.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const RPC_VERSION: u32 = 1;

pub mod op {
    pub const HELLO: u8 = 0;
    pub const IDENTIFY: u8 = 1;
    pub const IDENTIFIED: u8 = 2;
    pub const EVENT: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const REQUEST_RESPONSE: u8 = 7;
}

/// Close codes OBS uses to explain a refused handshake.
pub mod close_code {
    pub const AUTHENTICATION_FAILED: u16 = 4009;
    pub const UNSUPPORTED_RPC_VERSION: u16 = 4010;
}

/// Human-readable meaning of an OBS close code, when it is one we know.
pub fn describe_close_code(code: u16) -> Option<&'static str> {
    match code {
        close_code::AUTHENTICATION_FAILED => Some("authentication failed"),
        close_code::UNSUPPORTED_RPC_VERSION => Some("unsupported rpc version"),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T: Serialize> {
    op: u8,
    d: &'a T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub obs_web_socket_version: Option<String>,
    pub rpc_version: u32,
    #[serde(default)]
    pub authentication: Option<AuthChallenge>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub rpc_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    pub event_subscriptions: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    pub negotiated_rpc_version: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_type: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_data: Option<serde_json::Value>,
}

impl Request {
    /// New request with a fresh v4 request id.
    pub fn new(request_type: impl Into<String>, request_data: Option<serde_json::Value>) -> Self {
        Self {
            request_type: request_type.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            request_data,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default)]
    pub response_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestStatus {
    pub result: bool,
    pub code: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Compute the `authentication` string for `Identify`.
///
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn auth_string(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    STANDARD.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

/// Serialize `payload` under opcode `op`.
pub fn encode<T: Serialize>(op: u8, payload: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutgoingEnvelope { op, d: payload })
}

pub fn decode(text: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(text)
}
