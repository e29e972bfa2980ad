//! Error kinds surfaced to MCP callers.
//!
//! Every tool failure is one of these variants. Each carries a stable `code`
//! string and a recoverable/fatal hint so an agent can decide whether to retry
//! with different arguments or give up. Timeouts are deliberately NOT an error:
//! a timed-out operation still returns a well-formed reply with partial data.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Argument shape or value problems caught before any work happens.
    #[error("invalid arguments: {0}")]
    Validation(String),

    /// The resolved path is outside every allowed directory.
    #[error("path not allowed: {}", .0.display())]
    PathNotAllowed(PathBuf),

    /// The path (or a required parent) does not exist.
    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// Path resolution (symlink chasing included) exceeded the ceiling.
    #[error("path validation timed out: {}", .0.display())]
    ValidationTimeout(PathBuf),

    /// The command's program name matches a deny-list token.
    #[error("command blocked by rule '{rule}'")]
    CommandBlocked { rule: String },

    /// The command matches a destructive pattern and lacks the explicit
    /// permission token.
    #[error("destructive command blocked by rule '{rule}'")]
    DestructiveBlocked { rule: String },

    #[error("no process session with pid {0}")]
    SessionNotFound(u32),

    #[error("no search session with id '{0}'")]
    SearchNotFound(String),

    /// Write/interact attempted after the child exited.
    #[error("process session {0} has already finished")]
    SessionGone(u32),

    #[error("failed to spawn process: {0}")]
    SpawnFailure(#[source] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::PathNotAllowed(_) => "path_not_allowed",
            Self::PathNotFound(_) => "path_not_found",
            Self::ValidationTimeout(_) => "validation_timeout",
            Self::CommandBlocked { .. } => "command_blocked",
            Self::DestructiveBlocked { .. } => "destructive_blocked",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SearchNotFound(_) => "search_not_found",
            Self::SessionGone(_) => "session_gone",
            Self::SpawnFailure(_) => "spawn_failure",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller can reasonably retry with adjusted arguments.
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::SpawnFailure(_) | Self::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
