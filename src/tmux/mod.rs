//! Shell-out driver for the tmux terminal multiplexer.
//!
//! Every operation spawns a `tmux` subprocess with a hard per-call timeout.
//! A nonzero exit surfaces as [`TmuxError::CommandFailed`] with stderr; there
//! are no retries. Availability is checked once at session start.

use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::util::find_executable;

/// Prefix applied to every session this crate creates.
pub const SESSION_PREFIX: &str = "konsolai-";

/// Default session-name template; `{profile}` and `{id}` are substituted.
pub const SESSION_NAME_TEMPLATE: &str = "konsolai-{profile}-{id}";

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Error types for tmux operations
#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux not found or not installed")]
    NotFound,

    #[error("tmux command timed out after {0:?}")]
    Timeout(Duration),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    #[error("Invalid session name: {0}")]
    InvalidSessionName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One row of `tmux list-sessions` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxSessionInfo {
    pub name: String,
    pub windows: u32,
    pub created: String,
    pub attached: bool,
}

/// Client for driving tmux from the control plane.
#[derive(Debug, Clone)]
pub struct TmuxDriver {
    command_timeout: Duration,
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxDriver {
    pub fn new() -> Self {
        Self {
            command_timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    /// Whether a tmux binary is on PATH.
    pub fn is_available() -> bool {
        find_executable("tmux").is_some()
    }

    /// tmux version string, e.g. "tmux 3.4".
    pub async fn version(&self) -> Result<String, TmuxError> {
        let output = self.run_with_timeout(&["-V"], VERSION_TIMEOUT).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Generate a new 8-character lowercase hex session id.
    pub fn generate_session_id() -> String {
        let mut rng = rand::rng();
        (0..8)
            .map(|_| {
                let n: u8 = rng.random_range(0..16);
                char::from_digit(n as u32, 16).unwrap_or('0')
            })
            .collect()
    }

    /// Render a session name from the template and sanitize it.
    ///
    /// tmux target syntax reserves `:` and `.`, so both are replaced with `-`.
    pub fn build_session_name(profile_name: &str, session_id: &str, template: Option<&str>) -> String {
        let template = match template {
            Some(t) if !t.is_empty() => t,
            _ => SESSION_NAME_TEMPLATE,
        };
        template
            .replace("{profile}", profile_name)
            .replace("{id}", session_id)
            .replace(['.', ':'], "-")
    }

    /// Validate a session name against tmux's reserved characters.
    pub fn validate_session_name(name: &str) -> Result<(), TmuxError> {
        if name.is_empty() {
            return Err(TmuxError::InvalidSessionName(
                "session name cannot be empty".to_string(),
            ));
        }
        if name.contains(':') || name.contains('.') {
            return Err(TmuxError::InvalidSessionName(
                "session name cannot contain ':' or '.' characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the shell command that creates (or attaches to) a session.
    ///
    /// `tmux new-session [-A] -s <name> [-c <dir>] -- <command>`; `-A`
    /// attaches when the session already exists.
    pub fn build_new_session_command(
        session_name: &str,
        command: &str,
        attach_if_existing: bool,
        working_dir: &str,
    ) -> String {
        let mut parts = vec!["tmux".to_string(), "new-session".to_string()];
        if attach_if_existing {
            parts.push("-A".to_string());
        }
        parts.push("-s".to_string());
        parts.push(session_name.to_string());
        if !working_dir.is_empty() {
            parts.push("-c".to_string());
            parts.push(working_dir.to_string());
        }
        parts.push("--".to_string());
        parts.push(command.to_string());
        parts.join(" ")
    }

    /// Build the shell command that attaches to an existing session.
    pub fn build_attach_command(session_name: &str) -> String {
        format!("tmux attach-session -t {session_name}")
    }

    /// Create a detached session running `command`, or leave an existing one
    /// alone when `attach_if_existing` is set. Idempotent create-or-attach.
    pub async fn new_session(
        &self,
        session_name: &str,
        command: &str,
        attach_if_existing: bool,
        working_dir: &str,
    ) -> Result<(), TmuxError> {
        Self::validate_session_name(session_name)?;
        if attach_if_existing && self.exists(session_name).await {
            return Ok(());
        }

        let mut args = vec!["new-session", "-d", "-s", session_name];
        if !working_dir.is_empty() {
            args.push("-c");
            args.push(working_dir);
        }
        args.push("--");
        args.push(command);
        self.run(&args).await?;
        Ok(())
    }

    /// List all tmux sessions.
    pub async fn list(&self) -> Result<Vec<MuxSessionInfo>, TmuxError> {
        let output = self
            .run(&[
                "list-sessions",
                "-F",
                "#{session_name}:#{session_windows}:#{session_created}:#{session_attached}",
            ])
            .await?;
        Ok(parse_session_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// List sessions created by this crate (name prefix filter).
    ///
    /// A missing tmux server reads as "no sessions", not an error.
    pub async fn list_konsolai_sessions(&self) -> Vec<MuxSessionInfo> {
        match self.list().await {
            Ok(sessions) => sessions
                .into_iter()
                .filter(|s| s.name.starts_with(SESSION_PREFIX))
                .collect(),
            Err(err) => {
                debug!(error = %err, "tmux list-sessions unavailable");
                Vec::new()
            }
        }
    }

    /// Whether a session exists.
    pub async fn exists(&self, session_name: &str) -> bool {
        self.run(&["has-session", "-t", session_name]).await.is_ok()
    }

    /// Kill a session.
    pub async fn kill(&self, session_name: &str) -> Result<(), TmuxError> {
        self.run(&["kill-session", "-t", session_name]).await?;
        Ok(())
    }

    /// Detach any client connected to a session; the session keeps running.
    pub async fn detach(&self, session_name: &str) -> Result<(), TmuxError> {
        self.run(&["detach-client", "-s", session_name]).await?;
        Ok(())
    }

    /// Send literal text to a session's active pane.
    pub async fn send_keys(&self, session_name: &str, text: &str) -> Result<(), TmuxError> {
        // -l sends the text verbatim instead of interpreting key names.
        self.run(&["send-keys", "-t", session_name, "-l", text])
            .await?;
        Ok(())
    }

    /// Send a named key sequence (e.g. "C-c", "Tab", "Enter").
    pub async fn send_key_sequence(&self, session_name: &str, seq: &str) -> Result<(), TmuxError> {
        self.run(&["send-keys", "-t", session_name, seq]).await?;
        Ok(())
    }

    /// Capture pane scrollback between `start_line` and `end_line`
    /// (negative = lines above the visible bottom).
    pub async fn capture_pane(
        &self,
        session_name: &str,
        start_line: i32,
        end_line: i32,
    ) -> Result<String, TmuxError> {
        let start = start_line.to_string();
        let end = end_line.to_string();
        let output = self
            .run(&[
                "capture-pane",
                "-t",
                session_name,
                "-p",
                "-S",
                &start,
                "-E",
                &end,
            ])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Current working directory of the session's active pane.
    pub async fn pane_working_directory(&self, session_name: &str) -> Result<String, TmuxError> {
        let output = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                session_name,
                "#{pane_current_path}",
            ])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, TmuxError> {
        self.run_with_timeout(args, self.command_timeout).await
    }

    async fn run_with_timeout(
        &self,
        args: &[&str],
        wait: Duration,
    ) -> Result<std::process::Output, TmuxError> {
        let child = Command::new("tmux")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => TmuxError::NotFound,
                _ => TmuxError::Io(err),
            })?;

        let output = timeout(wait, child.wait_with_output())
            .await
            .map_err(|_| TmuxError::Timeout(wait))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TmuxError::CommandFailed(stderr));
        }
        Ok(output)
    }
}

fn parse_session_list(output: &str) -> Vec<MuxSessionInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() < 4 {
                return None;
            }
            Some(MuxSessionInfo {
                name: parts[0].to_string(),
                windows: parts[1].parse().unwrap_or(0),
                created: parts[2].to_string(),
                attached: parts[3] == "1",
            })
        })
        .collect()
}
