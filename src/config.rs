//! Daemon configuration.
//!
//! Loaded once at startup from `~/.hostshell/config.json`. Every field has a
//! default so a missing or partial file works; CLI flags are merged on top
//! after loading. The config file is a startup input only -- runtime mutations
//! (block_command / unblock_command) stay in memory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default deny-list tokens. Program names, matched case-insensitively
/// against the first shell-word of a command. `rm` is intentionally absent:
/// recursive-force deletes are handled by the destructive-action rule, which
/// honors the explicit permission token.
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &[
    "sudo", "su", "shutdown", "reboot", "halt", "poweroff", "mkfs", "fdisk", "mount", "umount",
    "passwd",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Directories the agent may touch. `~` expands to the user's home,
    /// relative entries are joined with the CWD at load time. A single "/"
    /// entry disables the restriction.
    pub allowed_directories: Vec<String>,
    /// Program-name tokens denied outright.
    pub blocked_commands: Vec<String>,
    /// Shell used for `start_process` when the call doesn't override it.
    /// Defaults to `/bin/sh` on Unix and `%COMSPEC%` on Windows.
    pub default_shell: Option<String>,
    /// Per-session output buffer cap in bytes. Overflow drops the oldest
    /// bytes and sets the session's truncated flag.
    pub session_buffer_bytes: usize,
    /// How long a finished process session stays readable.
    pub session_linger_secs: u64,
    /// How long a completed search session survives without a read.
    pub search_idle_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_directories: vec!["~".to_string()],
            blocked_commands: DEFAULT_BLOCKED_COMMANDS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            default_shell: None,
            session_buffer_bytes: 1024 * 1024,
            session_linger_secs: 120,
            search_idle_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is absent.
    /// A present-but-malformed file is an error: silently ignoring a typo'd
    /// allow-list would widen the sandbox.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// The shell to spawn commands with, honoring config then platform.
    pub fn shell(&self) -> String {
        if let Some(shell) = &self.default_shell {
            return shell.clone();
        }
        default_shell()
    }
}

/// Platform default shell. `SHELL`/`COMSPEC` are honored before the
/// hard-coded fallback.
pub fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    } else {
        "/bin/sh".to_string()
    }
}

/// `~/.hostshell/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hostshell")
        .join("config.json")
}
