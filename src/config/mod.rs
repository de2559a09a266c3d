//! Configuration module
//!
//! Handles loading the service configuration and the step catalog.

mod service;
mod steps;

pub use service::*;
pub use steps::*;
