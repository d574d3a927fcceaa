//! Claude Code hooks configuration for a konsolai session.
//!
//! The generated fragment maps every recognized hook event to an invocation
//! of the `konsolai-hook` sidecar with the session's socket path. Only the
//! `hooks` key is konsolai's; everything else in the project's
//! `.claude/settings.local.json` is preserved on merge.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::HookError;

/// Hook event types wired into the project settings.
pub const HOOK_EVENT_TYPES: &[&str] = &[
    "Stop",
    "PreToolUse",
    "PostToolUse",
    "PermissionRequest",
    "Notification",
    "SubagentStart",
    "SubagentStop",
    "TeammateIdle",
    "TaskCompleted",
];

/// Settings file the Claude CLI reads hooks from, relative to a project.
pub const SETTINGS_LOCAL_PATH: &str = ".claude/settings.local.json";

/// Generate the hooks configuration fragment for a session.
///
/// Pure: the result depends only on the arguments. The exact shape is owned
/// by the Claude CLI; konsolai treats it as opaque beyond the `hooks` key.
pub fn generate_hooks_config(hook_binary: &Path, socket_path: &Path) -> Value {
    let mut hooks = Map::new();
    for event in HOOK_EVENT_TYPES {
        let command = format!(
            "{} --socket {} --event {}",
            hook_binary.display(),
            socket_path.display(),
            event
        );
        hooks.insert(
            (*event).to_string(),
            json!([{
                "matcher": "*",
                "hooks": [{"type": "command", "command": command}],
            }]),
        );
    }
    json!({ "hooks": Value::Object(hooks) })
}

/// Merge the fragment's `hooks` key into the project's settings file.
///
/// Existing settings are preserved; a missing or unparseable file is treated
/// as empty. Returns the settings file path.
pub fn write_hooks_config(working_dir: &Path, fragment: &Value) -> Result<PathBuf, HookError> {
    let settings_path = working_dir.join(SETTINGS_LOCAL_PATH);
    if let Some(parent) = settings_path.parent() {
        fs::create_dir_all(parent).map_err(|source| HookError::ConfigWrite {
            path: settings_path.display().to_string(),
            source,
        })?;
    }

    let mut settings = read_settings(&settings_path);
    if let Some(hooks) = fragment.get("hooks") {
        settings.insert("hooks".to_string(), hooks.clone());
    }

    write_atomic(&settings_path, &Value::Object(settings))?;
    Ok(settings_path)
}

/// Remove the `hooks` key from the project's settings file, keeping the rest.
///
/// A missing file is not an error.
pub fn remove_hooks_config(working_dir: &Path) -> Result<(), HookError> {
    let settings_path = working_dir.join(SETTINGS_LOCAL_PATH);
    if !settings_path.exists() {
        return Ok(());
    }

    let mut settings = read_settings(&settings_path);
    if settings.remove("hooks").is_some() {
        write_atomic(&settings_path, &Value::Object(settings))?;
    }
    Ok(())
}

fn read_settings(path: &Path) -> Map<String, Value> {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

fn write_atomic(path: &Path, value: &Value) -> Result<(), HookError> {
    let text = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text).map_err(|source| HookError::ConfigWrite {
        path: tmp.display().to_string(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| HookError::ConfigWrite {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}
