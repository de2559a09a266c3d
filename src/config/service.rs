//! Service configuration
//!
//! Loads the service configuration from a TOML file. Every section and field
//! has a default, so a partial (or absent) file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::StepConfig;
use crate::command::{CommandPolicy, DEFAULT_BLOCKED_COMMANDS};

/// Configuration file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "shell-bridge.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Request path of the shell endpoint
    pub path: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 24050,
            path: "/api/shell".to_string(),
        }
    }
}

/// WebSocket upgrade and transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebSocketSection {
    /// Origins allowed to open a shell; `*` allows any
    pub allowed_origins: Vec<String>,
    /// Largest inbound message accepted
    pub max_message_size: usize,
    pub write_buffer_size: usize,
    /// Deadline for a single outbound frame
    pub write_timeout_secs: u64,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            max_message_size: 1 << 20,
            write_buffer_size: 1024,
            write_timeout_secs: 10,
        }
    }
}

/// Interactive shell settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellSection {
    /// Shell program attached to each PTY
    pub program: String,
    /// Extra arguments for the shell program
    pub args: Vec<String>,
    /// Working directory; defaults to the user's home directory
    pub working_dir: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Upper bound on how long a startup command waits for the shell to
    /// print its first output
    pub startup_delay_ms: u64,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            program: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            cols: 80,
            rows: 24,
            startup_delay_ms: 300,
        }
    }
}

/// Command denylist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicySection {
    pub blocked_commands: Vec<String>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            blocked_commands: DEFAULT_BLOCKED_COMMANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PolicySection {
    /// Build the runtime policy
    pub fn command_policy(&self) -> CommandPolicy {
        CommandPolicy::new(self.blocked_commands.iter().cloned())
    }
}

/// One-shot execution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecSection {
    /// Shell used as `<shell> -c <command>`
    pub shell: String,
    pub timeout_secs: u64,
}

impl Default for ExecSection {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            timeout_secs: 30 * 60,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Root service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub exec: ExecSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Steps resolvable through the `step_id` query parameter
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl ServiceConfig {
    /// Load configuration
    ///
    /// An explicit path must exist. Without one, `shell-bridge.toml` in the
    /// current directory is used if present, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would only fail later at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.program.trim().is_empty() {
            return Err(ConfigError::Invalid("shell.program must not be empty".into()));
        }
        if self.exec.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("exec.shell must not be empty".into()));
        }
        if self.shell.cols == 0 || self.shell.rows == 0 {
            return Err(ConfigError::Invalid(
                "shell.cols and shell.rows must be positive".into(),
            ));
        }
        if self.websocket.write_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "websocket.write_timeout_secs must be positive".into(),
            ));
        }
        if self.exec.timeout_secs == 0 {
            return Err(ConfigError::Invalid("exec.timeout_secs must be positive".into()));
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/': {}",
                self.server.path
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate step id: {}", step.id)));
            }
        }

        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.socket_addr(), "127.0.0.1:24050");
        assert_eq!(config.server.path, "/api/shell");
        assert_eq!(config.shell.program, "/bin/bash");
        assert_eq!(config.websocket.allowed_origins, vec!["*".to_string()]);
        assert_eq!(config.websocket.write_timeout_secs, 10);
        assert_eq!(config.policy.blocked_commands.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ServiceConfig::from_toml(
            r#"
            [server]
            port = 9000

            [policy]
            blocked_commands = ["shutdown"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.shell.cols, 80);
        assert_eq!(config.policy.blocked_commands, vec!["shutdown".to_string()]);
        assert!(config.policy.command_policy().check("shutdown -r").is_err());
    }

    #[test]
    fn test_steps_parse() {
        let config = ServiceConfig::from_toml(
            r#"
            [[steps]]
            id = "deploy"
            multiplexed = true

            [steps.variables]
            ENV = "staging"
            "#,
        )
        .unwrap();

        assert_eq!(config.steps.len(), 1);
        assert_eq!(config.steps[0].id, "deploy");
        assert!(config.steps[0].multiplexed);
        assert_eq!(
            config.steps[0].variables.get("ENV").map(String::as_str),
            Some("staging")
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = ServiceConfig::from_toml(
            r#"
            [shell]
            program = ""
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = ServiceConfig::from_toml(
            r#"
            [server]
            path = "shell"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let result = ServiceConfig::from_toml(
            r#"
            [[steps]]
            id = "a"
            [[steps]]
            id = "a"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = ServiceConfig::from_toml("[server\nport = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[shell]\nprogram = \"/bin/sh\"\nstartup_delay_ms = 50").unwrap();

        let config = ServiceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.shell.program, "/bin/sh");
        assert_eq!(config.shell.startup_delay_ms, 50);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = TempDir::new().unwrap();
        let result = ServiceConfig::load(Some(&dir.path().join("missing.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
