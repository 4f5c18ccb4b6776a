//! # OBS action endpoint
//!
//! Scene switching over obs-websocket v5.
//!
//! ## What It Does
//!
//! 1. **Handshake**: Hello → Identify (with challenge/response auth when
//!    the server asks for it) → Identified.
//! 2. **Scene switching**: `SetCurrentProgramScene` requests, one at a time,
//!    each matched to its response by request id.
//! 3. **Startup checks**: `GetSceneList` for scene verification and,
//!    optionally, starting the virtual camera.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut obs = ObsClient::new(config.obs.clone());
//! obs.connect().await?;
//! obs.activate("Toolhead").await?;
//! obs.disconnect().await;
//! ```

pub mod client;
pub mod protocol;

pub use client::ObsClient;
