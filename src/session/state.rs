//! Persistent state of a Claude session.
//!
//! Saved across restarts so orphaned tmux sessions can be rediscovered and
//! reattached. Remote fields are only present for sessions discovered over
//! SSH; those are tracked but never driven by this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted per-session metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// Full tmux session name (e.g. "konsolai-default-a1b2c3d4")
    pub session_name: String,
    /// Unique session id (8 hex chars)
    pub session_id: String,
    /// Profile the session was created with
    pub profile_name: String,

    pub created: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,

    /// Initial working directory (absolute)
    pub working_directory: String,
    /// Claude model name; empty means the CLI default
    pub claude_model: String,

    /// Whether this process currently has a terminal attached. Forced to
    /// false on load; only meaningful at runtime.
    pub is_attached: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_continue_prompt: Option<String>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_remote: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
}

impl Default for SessionState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            session_name: String::new(),
            session_id: String::new(),
            profile_name: String::new(),
            created: now,
            last_accessed: now,
            working_directory: String::new(),
            claude_model: String::new(),
            is_attached: false,
            auto_continue_prompt: None,
            is_remote: false,
            ssh_host: None,
            ssh_username: None,
            ssh_port: None,
        }
    }
}

impl SessionState {
    /// A state is valid when it carries both a session name and an id.
    pub fn is_valid(&self) -> bool {
        !self.session_name.is_empty() && !self.session_id.is_empty()
    }
}

/// Sessions are identified by their tmux session name alone.
impl PartialEq for SessionState {
    fn eq(&self, other: &Self) -> bool {
        self.session_name == other.session_name
    }
}

impl Eq for SessionState {}
