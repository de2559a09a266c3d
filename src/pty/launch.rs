//! Shell launch selection
//!
//! A launch is the program and arguments attached to a PTY: either the
//! configured shell, or an attach to a named multiplexer session that outlives
//! any single connection.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::{PtyError, PtyResult};

/// Terminal multiplexer used for named sessions
pub const MULTIPLEXER: &str = "tmux";

const MAX_SESSION_NAME_LENGTH: usize = 64;

/// Program and arguments to attach to a PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLaunch {
    pub program: String,
    pub args: Vec<String>,
    /// Set when attaching to a named multiplexer session
    pub session_name: Option<String>,
}

impl ShellLaunch {
    /// Launch a plain shell
    pub fn shell(program: impl Into<String>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
            session_name: None,
        }
    }

    /// Attach to a named multiplexer session
    pub fn attach(session_name: &str) -> PtyResult<Self> {
        validate_session_name(session_name)?;
        Ok(Self {
            program: MULTIPLEXER.to_string(),
            args: vec![
                "attach-session".to_string(),
                "-t".to_string(),
                session_name.to_string(),
            ],
            session_name: Some(session_name.to_string()),
        })
    }

    /// Check if this launch attaches to a named session
    pub fn is_multiplexed(&self) -> bool {
        self.session_name.is_some()
    }
}

/// Session names are restricted so they are never parsed as tmux target
/// syntax (`session:window.pane`)
fn validate_session_name(name: &str) -> PtyResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SESSION_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PtyError::InvalidSessionName(name.to_string()))
    }
}

/// Create the named multiplexer session if it does not exist yet
pub async fn ensure_multiplexer_session(
    session_name: &str,
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> PtyResult<()> {
    validate_session_name(session_name)?;

    let exists = multiplexer(working_dir, env)
        .args(["has-session", "-t", session_name])
        .status()
        .await
        .map_err(|e| PtyError::SpawnFailed(format!("{MULTIPLEXER}: {e}")))?
        .success();

    if exists {
        debug!("Reusing {} session {}", MULTIPLEXER, session_name);
        return Ok(());
    }

    info!("Creating {} session {}", MULTIPLEXER, session_name);
    let status = multiplexer(working_dir, env)
        .args(["new-session", "-d", "-s", session_name])
        .status()
        .await
        .map_err(|e| PtyError::SpawnFailed(format!("{MULTIPLEXER}: {e}")))?;

    if !status.success() {
        return Err(PtyError::SpawnFailed(format!(
            "failed to create {MULTIPLEXER} session {session_name}: {status}"
        )));
    }

    Ok(())
}

fn multiplexer(working_dir: &Path, env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new(MULTIPLEXER);
    cmd.current_dir(working_dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_shell() {
        let launch = ShellLaunch::shell("/bin/bash", &["-l".to_string()]);
        assert_eq!(launch.program, "/bin/bash");
        assert_eq!(launch.args, vec!["-l".to_string()]);
        assert!(!launch.is_multiplexed());
    }

    #[test]
    fn test_attach_launch() {
        let launch = ShellLaunch::attach("flows_session").unwrap();
        assert_eq!(launch.program, MULTIPLEXER);
        assert_eq!(launch.args, vec!["attach-session", "-t", "flows_session"]);
        assert_eq!(launch.session_name.as_deref(), Some("flows_session"));
        assert!(launch.is_multiplexed());
    }

    #[test]
    fn test_attach_rejects_target_syntax() {
        for name in ["", "a:b", "a.b", "name with space", "-x;rm"] {
            assert!(
                matches!(ShellLaunch::attach(name), Err(PtyError::InvalidSessionName(_))),
                "accepted {name:?}"
            );
        }
        let long = "a".repeat(MAX_SESSION_NAME_LENGTH + 1);
        assert!(ShellLaunch::attach(&long).is_err());
    }

    #[tokio::test]
    async fn test_ensure_rejects_invalid_name_before_running() {
        let result = ensure_multiplexer_session("bad:name", Path::new("/tmp"), &HashMap::new()).await;
        assert!(matches!(result, Err(PtyError::InvalidSessionName(_))));
    }
}
