use thiserror::Error;

/// Main error type for konsolai operations.
///
/// Fatal conditions never abort the process; they surface as session
/// creation failures or `Error`-state sessions, and recovery is explicit
/// (restart session, re-start hook server, rewrite config).
#[derive(Error, Debug)]
pub enum KonsolaiError {
    /// tmux is not installed or a tmux call failed
    #[error("Multiplexer error: {0}")]
    Tmux(#[from] crate::tmux::TmuxError),

    /// Hook wire layer failure (socket bind, config write)
    #[error("Hook error: {0}")]
    Hook(#[from] konsolai_hooks::HookError),

    /// The Claude CLI binary could not be found
    #[error("Claude CLI is not installed or not in PATH")]
    AgentCliUnavailable,

    /// Session-scoped failure
    #[error("Session error [{session_name}]: {message}")]
    Session {
        session_name: String,
        message: String,
    },

    /// State file could not be read or written
    #[error("Persistence error at {path}: {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, KonsolaiError>;
