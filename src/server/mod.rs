//! WebSocket server module
//!
//! Accepts shell connections on the configured endpoint, screens upgrade
//! requests and bridges each accepted connection to its own PTY session.

mod handshake;
mod websocket;

pub use websocket::WebSocketServer;
