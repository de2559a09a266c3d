//! Process environment helpers

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolve the directory commands and shells start in
///
/// Order: configured directory, the invoking user's home, the current
/// directory, `/`.
pub fn workspace_dir(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .or_else(dirs::home_dir)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// `PATH` given to every command and shell, independent of how the server
/// was started
pub const COMMAND_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Build the override set applied on top of the inherited environment
///
/// `HOME`, `USER` and `PATH` are pinned; caller variables win over them.
/// Both the one-shot executor and interactive shells start from this set.
pub fn command_overrides(variables: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = HashMap::with_capacity(variables.len() + 3);
    if let Some(home) = dirs::home_dir() {
        env.insert("HOME".to_string(), home.to_string_lossy().into_owned());
    }
    env.insert(
        "USER".to_string(),
        std::env::var("USER").unwrap_or_default(),
    );
    env.insert("PATH".to_string(), COMMAND_PATH.to_string());
    env.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
