//! Hook wire layer for konsolai.
//!
//! Claude Code hooks are configured to invoke the `konsolai-hook` sidecar,
//! which connects to a per-session Unix socket owned by [`server::HookServer`]
//! and writes exactly one newline-terminated JSON frame:
//!
//! ```json
//! {"event_type":"Stop","data":{},"session_id":"a1b2c3d4","working_dir":"/home/me/proj"}
//! ```
//!
//! Frames are LF-terminated; CRLF is not tolerated. Malformed frames are
//! dropped with an error event and the connection stays open.

pub mod config;
pub mod paths;
pub mod server;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted frame size (1 MiB). Oversized frames are dropped.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Environment variable the sidecar reads the session id from.
pub const SESSION_ID_ENV: &str = "KONSOLAI_SESSION_ID";

/// Error type for the hook wire layer
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Could not determine user data directory")]
    DataDirUnavailable,

    #[error("Failed to bind hook socket at {path}: {source}")]
    BindFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write hooks config at {path}: {source}")]
    ConfigWrite {
        path: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single hook frame as it travels over the socket.
///
/// `data` carries the event payload verbatim from the Claude CLI; the sidecar
/// adds `session_id` and `working_dir` from its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookFrame {
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub working_dir: String,
}

impl HookFrame {
    /// Build a frame for `event_type` around a payload object.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            session_id: String::new(),
            working_dir: String::new(),
        }
    }

    /// Serialize as a compact, LF-terminated wire line.
    pub fn to_wire_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Events emitted by the hook server.
#[derive(Debug, Clone)]
pub enum HookServerEvent {
    /// A well-formed frame arrived. `data` is the payload re-serialized as a
    /// compact JSON string.
    EventReceived { event_type: String, data: String },
    ClientConnected,
    ClientDisconnected,
    /// A frame failed to parse; the connection is kept open.
    Error(String),
}
