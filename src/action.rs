//! The scene-control seam between the bridge controller and OBS.

use std::future::Future;

use crate::error::ActionError;

/// Lifecycle of one connection. Owned by the client it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Something that can switch the remote endpoint to a named state.
///
/// Every method takes `&mut self`, so at most one request is in flight on
/// the underlying connection at any time.
pub trait ActionClient: Send {
    /// Open the connection. Returns `Ok` immediately when already connected.
    fn connect(&mut self) -> impl Future<Output = Result<(), ActionError>> + Send;

    /// Make `action` the active state.
    ///
    /// Fails with [`ActionError::NotConnected`] unless [`state`](Self::state)
    /// is `Connected`; never reconnects on its own.
    fn activate(&mut self, action: &str) -> impl Future<Output = Result<(), ActionError>> + Send;

    /// Names the remote endpoint currently accepts.
    fn available_actions(&mut self) -> impl Future<Output = Result<Vec<String>, ActionError>> + Send;

    /// Close the connection. Safe to call in any state, any number of times.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    fn state(&self) -> ConnectionState;
}
