//! Step catalog
//!
//! Resolves an opaque step identifier to the variables and named session a
//! shell connection should use. Steps come from the `[[steps]]` tables of the
//! service configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Session name used when a multiplexed step does not name one
pub const DEFAULT_SESSION_NAME: &str = "flows_session";

/// A step as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StepConfig {
    /// Identifier passed as `step_id`
    pub id: String,
    /// Variables substituted into the startup command and exported to the shell
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Attach to a named multiplexer session instead of a fresh shell
    #[serde(default)]
    pub multiplexed: bool,
    /// Name of the multiplexer session
    #[serde(default)]
    pub session_name: Option<String>,
}

/// What a resolved step contributes to a shell request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepContext {
    pub variables: HashMap<String, String>,
    pub session_name: Option<String>,
}

impl StepConfig {
    /// Resolve into a request context
    pub fn context(&self) -> StepContext {
        let session_name = self.multiplexed.then(|| {
            self.session_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string())
        });

        StepContext {
            variables: self.variables.clone(),
            session_name,
        }
    }
}

/// Lookup table of configured steps
#[derive(Debug, Clone, Default)]
pub struct StepCatalog {
    steps: HashMap<String, StepConfig>,
}

impl StepCatalog {
    /// Build a catalog from configured steps
    pub fn new(steps: impl IntoIterator<Item = StepConfig>) -> Self {
        Self {
            steps: steps
                .into_iter()
                .map(|step| (step.id.clone(), step))
                .collect(),
        }
    }

    /// Number of known steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Resolve a step identifier
    pub fn resolve(&self, step_id: &str) -> Option<StepContext> {
        self.steps.get(step_id).map(StepConfig::context)
    }
}
