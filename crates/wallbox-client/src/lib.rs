//! WebSocket client for the wallbox device status protocol.
//!
//! This crate provides:
//! - Connection and challenge–response authentication against the
//!   device's `ws://<host>/ws` endpoint
//! - A locally replicated key-value status document kept current via
//!   full and delta status updates
//! - Synchronous-feeling property access: `connect` blocks until the
//!   session is authenticated and the first full sync has landed
//! - Best-effort graceful close

mod client;
mod error;
mod session;
mod status;

pub use client::{ClientConfig, ConnectionState, WallboxClient};
pub use error::{ClientError, ClientResult};
