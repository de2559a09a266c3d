//! Session bridge module
//!
//! Relays bytes between a WebSocket connection and a PTY-backed shell, with
//! base64 framing and symmetric teardown.

mod codec;
mod pump;
mod session;

#[cfg(test)]
pub use codec::{decode, encode};
pub use session::{BridgeSettings, SessionBridge, ShellRequest};
