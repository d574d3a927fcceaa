//! Registry of all Claude sessions known to this process.
//!
//! Tracks live sessions attached here, persists state for every session ever
//! seen, and cross-references tmux every 30 seconds to discover orphans
//! (sessions that survived a previous run). Persistence is a versioned JSON
//! document written atomically on every change; in-memory state stays
//! authoritative when a write fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::tmux::TmuxDriver;
use crate::util::write_atomic;

use super::state::SessionState;
use super::ClaudeSession;

/// Session names parse as `konsolai-{profile}-{8-hex-id}`.
static SESSION_NAME_PATTERN: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^konsolai-(.+)-([a-f0-9]{8})$").expect("session name pattern")
});

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// On-disk shape of sessions.json.
#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    sessions: Vec<serde_json::Value>,
}

/// Events emitted by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    SessionRegistered(String),
    SessionUnregistered(String),
    OrphanedSessionsChanged,
    SessionsDiscovered(Vec<SessionState>),
}

/// Tracks active sessions and persisted session states.
pub struct SessionRegistry {
    tmux: TmuxDriver,
    active: DashMap<String, Arc<ClaudeSession>>,
    states: RwLock<HashMap<String, SessionState>>,
    state_file: PathBuf,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    /// Default state file path: `<data-dir>/konsolai/sessions.json`.
    pub fn default_state_file() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("konsolai").join("sessions.json"))
    }

    pub fn new(state_file: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let registry = Self {
            tmux: TmuxDriver::new(),
            active: DashMap::new(),
            states: RwLock::new(HashMap::new()),
            state_file,
            event_tx,
        };
        registry.load_state();
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Register a live session, creating or refreshing its persisted state.
    pub fn register(&self, session: &Arc<ClaudeSession>) {
        let name = session.session_name().to_string();
        self.active.insert(name.clone(), Arc::clone(session));

        {
            let mut states = self.lock_states();
            let created = states
                .get(&name)
                .map(|existing| existing.created)
                .unwrap_or_else(Utc::now);
            let state = SessionState {
                session_name: name.clone(),
                session_id: session.session_id().to_string(),
                profile_name: session.profile_name().to_string(),
                working_directory: session.working_directory(),
                claude_model: session.model().model_name().to_string(),
                created,
                last_accessed: Utc::now(),
                is_attached: true,
                ..SessionState::default()
            };
            states.insert(name.clone(), state);
        }

        let _ = self.event_tx.send(RegistryEvent::SessionRegistered(name));
        self.save_state();
    }

    /// Unregister a session: mark detached but keep its state.
    pub fn unregister(&self, session_name: &str) {
        self.active.remove(session_name);
        {
            let mut states = self.lock_states();
            if let Some(state) = states.get_mut(session_name) {
                state.is_attached = false;
                state.last_accessed = Utc::now();
            }
        }
        let _ = self
            .event_tx
            .send(RegistryEvent::SessionUnregistered(session_name.to_string()));
        self.save_state();
    }

    pub fn mark_attached(&self, session_name: &str) {
        self.set_attached(session_name, true);
    }

    pub fn mark_detached(&self, session_name: &str) {
        self.set_attached(session_name, false);
    }

    fn set_attached(&self, session_name: &str, attached: bool) {
        let mut changed = false;
        {
            let mut states = self.lock_states();
            if let Some(state) = states.get_mut(session_name) {
                state.is_attached = attached;
                state.last_accessed = Utc::now();
                changed = true;
            }
        }
        if changed {
            self.save_state();
        }
    }

    pub fn find(&self, session_name: &str) -> Option<Arc<ClaudeSession>> {
        self.active.get(session_name).map(|entry| entry.clone())
    }

    pub fn active_sessions(&self) -> Vec<Arc<ClaudeSession>> {
        self.active.iter().map(|entry| entry.clone()).collect()
    }

    pub fn all_session_states(&self) -> Vec<SessionState> {
        self.lock_states().values().cloned().collect()
    }

    /// Persisted state by session name.
    pub fn session_state(&self, session_name: &str) -> Option<SessionState> {
        self.lock_states().get(session_name).cloned()
    }

    /// Whether the session exists in tmux.
    pub async fn session_exists(&self, session_name: &str) -> bool {
        self.tmux.exists(session_name).await
    }

    /// Sessions alive in tmux but not attached to this process.
    pub async fn orphaned_sessions(&self) -> Vec<SessionState> {
        let live: Vec<String> = self
            .tmux
            .list_konsolai_sessions()
            .await
            .into_iter()
            .map(|info| info.name)
            .collect();
        self.lock_states()
            .values()
            .filter(|state| {
                !state.is_attached
                    && !self.active.contains_key(&state.session_name)
                    && live.contains(&state.session_name)
            })
            .cloned()
            .collect()
    }

    /// Auto-continue prompt from the most recently accessed session with this
    /// working directory.
    pub fn last_auto_continue_prompt(&self, working_directory: &str) -> Option<String> {
        self.last_session_state(working_directory)
            .and_then(|state| state.auto_continue_prompt)
    }

    /// Most recently accessed state with this working directory.
    pub fn last_session_state(&self, working_directory: &str) -> Option<SessionState> {
        self.lock_states()
            .values()
            .filter(|state| state.working_directory == working_directory)
            .max_by_key(|state| state.last_accessed)
            .cloned()
    }

    /// Update the auto-continue prompt for a session and persist.
    pub fn update_session_prompt(&self, session_name: &str, prompt: &str) {
        let mut changed = false;
        {
            let mut states = self.lock_states();
            if let Some(state) = states.get_mut(session_name) {
                state.auto_continue_prompt = if prompt.is_empty() {
                    None
                } else {
                    Some(prompt.to_string())
                };
                changed = true;
            }
        }
        if changed {
            self.save_state();
        }
    }

    /// Re-sync persisted states with what tmux reports.
    ///
    /// Newly discovered sessions (from a previous run or created out-of-band)
    /// get synthesized states; states whose session vanished from tmux and is
    /// not active here are dropped.
    pub async fn refresh_orphaned_sessions(&self) {
        let live = self.tmux.list_konsolai_sessions().await;
        let mut changed = false;

        {
            let mut states = self.lock_states();

            for info in &live {
                if !states.contains_key(&info.name) {
                    let mut state = SessionState {
                        session_name: info.name.clone(),
                        created: Utc::now(),
                        last_accessed: Utc::now(),
                        is_attached: self.active.contains_key(&info.name),
                        ..SessionState::default()
                    };
                    if let Some(captures) = SESSION_NAME_PATTERN.captures(&info.name) {
                        state.profile_name = captures[1].to_string();
                        state.session_id = captures[2].to_string();
                    }
                    debug!(session = %info.name, "discovered tmux session");
                    states.insert(info.name.clone(), state);
                    changed = true;
                }
            }

            let gone: Vec<String> = states
                .keys()
                .filter(|name| {
                    !live.iter().any(|info| &info.name == *name)
                        && !self.active.contains_key(*name)
                })
                .cloned()
                .collect();
            for name in gone {
                states.remove(&name);
                changed = true;
            }
        }

        if changed {
            let _ = self.event_tx.send(RegistryEvent::OrphanedSessionsChanged);
            self.save_state();
        }
    }

    /// Spawn the 30-second refresh loop.
    pub fn spawn_refresh_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => registry.refresh_orphaned_sessions().await,
                }
            }
        })
    }

    /// Parse the output of remote `.claude` discovery into remote states.
    ///
    /// Each line is an absolute `<project>/.claude` path; blanks are skipped
    /// and the trailing `/.claude` is stripped.
    pub fn parse_remote_discovery_output(
        output: &str,
        host: &str,
        username: &str,
        port: u16,
    ) -> Vec<SessionState> {
        output
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                let working_directory = trimmed
                    .strip_suffix("/.claude")
                    .unwrap_or(trimmed)
                    .to_string();
                let session_id = TmuxDriver::generate_session_id();
                Some(SessionState {
                    session_name: TmuxDriver::build_session_name(host, &session_id, None),
                    session_id,
                    profile_name: host.to_string(),
                    working_directory,
                    is_remote: true,
                    ssh_host: Some(host.to_string()),
                    ssh_username: Some(username.to_string()),
                    ssh_port: Some(port),
                    ..SessionState::default()
                })
            })
            .collect()
    }

    /// Scan a directory tree for projects carrying a `.claude` footprint.
    ///
    /// Finds any project used with Claude, not just konsolai sessions. The
    /// result is broadcast and returned; nothing is persisted.
    pub fn discover_sessions(&self, search_root: &Path) -> Vec<SessionState> {
        let mut discovered = Vec::new();
        for entry in WalkDir::new(search_root)
            .max_depth(3)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir() && entry.file_name() == ".claude")
        {
            let Some(project) = entry.path().parent() else {
                continue;
            };
            let profile = project
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string());
            let session_id = TmuxDriver::generate_session_id();
            discovered.push(SessionState {
                session_name: TmuxDriver::build_session_name(&profile, &session_id, None),
                session_id,
                profile_name: profile,
                working_directory: project.to_string_lossy().to_string(),
                ..SessionState::default()
            });
        }

        if !discovered.is_empty() {
            let _ = self
                .event_tx
                .send(RegistryEvent::SessionsDiscovered(discovered.clone()));
        }
        discovered
    }

    fn load_state(&self) {
        let text = match std::fs::read_to_string(&self.state_file) {
            Ok(text) => text,
            Err(_) => return,
        };
        let file: StateFile = match serde_json::from_str(&text) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %self.state_file.display(), error = %err, "failed to load session state");
                return;
            }
        };

        let mut states = self.lock_states();
        for value in file.sessions {
            // Invalid entries are skipped, not fatal.
            match serde_json::from_value::<SessionState>(value) {
                Ok(mut state) if state.is_valid() => {
                    // Freshly loaded from disk means nothing is attached yet.
                    state.is_attached = false;
                    states.insert(state.session_name.clone(), state);
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "skipping invalid session state entry"),
            }
        }
    }

    fn save_state(&self) {
        let sessions: Vec<serde_json::Value> = self
            .lock_states()
            .values()
            .filter_map(|state| serde_json::to_value(state).ok())
            .collect();
        let file = StateFile {
            version: 1,
            sessions,
        };
        match serde_json::to_string_pretty(&file) {
            Ok(text) => {
                if let Err(err) = write_atomic(&self.state_file, &text) {
                    // In-memory state stays authoritative.
                    warn!(path = %self.state_file.display(), error = %err, "session state save failed");
                }
            }
            Err(err) => warn!(error = %err, "session state serialization failed"),
        }
    }

    fn lock_states(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SessionState>> {
        self.states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
