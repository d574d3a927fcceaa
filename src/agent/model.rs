//! Claude model aliases and CLI command construction.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::util::find_executable;

/// Known agent model families. `Default` lets the CLI pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgentModel {
    #[default]
    Default,
    Opus,
    Sonnet,
    Haiku,
}

impl AgentModel {
    /// Full model id passed to `claude --model`; empty for `Default`.
    pub fn model_name(&self) -> &'static str {
        match self {
            AgentModel::Opus => "claude-opus-4-5",
            AgentModel::Sonnet => "claude-sonnet-4",
            AgentModel::Haiku => "claude-haiku",
            AgentModel::Default => "",
        }
    }

    /// Short alias used in UI labels; empty for `Default`.
    pub fn short_name(&self) -> &'static str {
        match self {
            AgentModel::Opus => "opus",
            AgentModel::Sonnet => "sonnet",
            AgentModel::Haiku => "haiku",
            AgentModel::Default => "",
        }
    }

    /// Parse a model name by substring, case-insensitive. Unknown → Default.
    pub fn parse(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("opus") {
            AgentModel::Opus
        } else if lower.contains("sonnet") {
            AgentModel::Sonnet
        } else if lower.contains("haiku") {
            AgentModel::Haiku
        } else {
            AgentModel::Default
        }
    }
}

/// Build the shell command that starts the agent CLI.
pub fn build_agent_command(model: AgentModel, extra_args: &[String]) -> String {
    let mut parts = vec!["claude".to_string()];
    if model != AgentModel::Default {
        parts.push("--model".to_string());
        parts.push(model.model_name().to_string());
    }
    parts.extend(extra_args.iter().cloned());
    parts.join(" ")
}

/// Locate the agent CLI binary: PATH first, then common install locations.
pub fn agent_executable_path() -> Option<PathBuf> {
    if let Some(path) = find_executable("claude") {
        return Some(path);
    }

    let mut candidates = vec![
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/usr/bin/claude"),
    ];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".local/bin/claude"));
        candidates.push(home.join(".claude/local/claude"));
    }
    candidates.into_iter().find(|p| p.exists())
}

/// Whether the agent CLI is installed.
pub fn is_agent_available() -> bool {
    agent_executable_path().is_some()
}
