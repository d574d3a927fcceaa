//! Persisted application settings.
//!
//! Defaults applied to new sessions (yolo levels, auto-continue prompt) plus
//! discovery configuration. Stored as a single JSON document under the
//! konsolai data directory; a missing or unparseable file yields defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::observer::ObserverPolicy;
use crate::tmux::SESSION_NAME_TEMPLATE;
use crate::util::write_atomic;

/// Prompt sent on idle when triple yolo is active and no custom prompt is set.
pub const DEFAULT_AUTO_CONTINUE_PROMPT: &str =
    "Continue improving, debugging, fixing, adding features, or introducing tests where applicable.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KonsolaiSettings {
    /// Default L1 (auto-approve permissions) for new sessions
    pub yolo_mode: bool,
    /// Default L2 (auto-accept suggestions) for new sessions
    pub double_yolo_mode: bool,
    /// Default L3 (auto-continue on idle) for new sessions
    pub triple_yolo_mode: bool,
    /// With L2 and L3 both on, try the suggestion path before auto-continue
    pub try_suggestions_first: bool,
    pub auto_continue_prompt: String,
    /// Session-name template; `{profile}` and `{id}` are substituted
    pub session_name_template: String,
    /// Hosts scanned by remote discovery ("user@host" or "user@host:port")
    pub ssh_discovery_hosts: Vec<String>,
    pub observer_policy: ObserverPolicy,
}

impl Default for KonsolaiSettings {
    fn default() -> Self {
        Self {
            yolo_mode: false,
            double_yolo_mode: false,
            triple_yolo_mode: false,
            try_suggestions_first: true,
            auto_continue_prompt: DEFAULT_AUTO_CONTINUE_PROMPT.to_string(),
            session_name_template: SESSION_NAME_TEMPLATE.to_string(),
            ssh_discovery_hosts: Vec::new(),
            observer_policy: ObserverPolicy::default(),
        }
    }
}

impl KonsolaiSettings {
    /// Default settings file path: `<data-dir>/konsolai/settings.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("konsolai").join("settings.json"))
    }

    /// Load settings from `path`, falling back to defaults on any failure.
    pub fn load_from(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "invalid settings file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Load from the default location.
    pub fn load() -> Self {
        Self::default_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Persist settings atomically.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serialize settings")?;
        write_atomic(path, &text)
            .with_context(|| format!("write settings to {}", path.display()))
    }

    pub fn set_ssh_discovery_hosts(&mut self, hosts: Vec<String>) {
        self.ssh_discovery_hosts = hosts;
    }
}
