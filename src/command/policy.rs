//! Command denylist
//!
//! Shared by the interactive bridge and the one-shot executor. Matching is a
//! case-sensitive plain substring search against every configured pattern.

use thiserror::Error;

/// Patterns blocked when the configuration does not provide its own list
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &["rm -rf /", "mkfs", "dd if=/dev/zero"];

/// A command matched a blocked pattern
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Command blocked by security policy (matched {pattern:?})")]
pub struct PolicyViolation {
    /// The pattern that matched
    pub pattern: String,
}

/// Denylist of forbidden command substrings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandPolicy {
    blocked: Vec<String>,
}

impl CommandPolicy {
    /// Create a policy from a list of blocked substrings
    ///
    /// Empty patterns are discarded; they would match every command.
    pub fn new<I, S>(blocked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: blocked
                .into_iter()
                .map(Into::into)
                .filter(|pattern: &String| !pattern.is_empty())
                .collect(),
        }
    }

    /// Get the configured patterns
    pub fn patterns(&self) -> &[String] {
        &self.blocked
    }

    /// Find the first blocked pattern contained in `command`
    pub fn blocked_pattern(&self, command: &str) -> Option<&str> {
        self.blocked
            .iter()
            .find(|pattern| command.contains(pattern.as_str()))
            .map(String::as_str)
    }

    /// Check a command against the denylist
    pub fn check(&self, command: &str) -> Result<(), PolicyViolation> {
        match self.blocked_pattern(command) {
            Some(pattern) => Err(PolicyViolation {
                pattern: pattern.to_string(),
            }),
            None => Ok(()),
        }
    }
}
