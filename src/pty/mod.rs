//! PTY management module
//!
//! Provides PTY-backed shell sessions and the launch variants attached to them.
//! Uses portable-pty for PTY allocation and child management.

mod launch;
mod session;

pub use launch::*;
pub use session::*;
