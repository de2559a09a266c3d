//! Command handling shared by both execution paths
//!
//! Denylist policy, `${key}` templating, environment setup, and the one-shot
//! executor.

mod env;
mod exec;
mod policy;
mod template;

pub use env::*;
pub use exec::*;
pub use policy::*;
pub use template::substitute;
