//! UI-facing session metadata: pin/archive/expired flags.
//!
//! Separate from the registry's session states; this store never deletes an
//! entry. Archiving kills the tmux backend but preserves the metadata so the
//! session can be recreated later in the same working directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::tmux::TmuxDriver;
use crate::util::write_atomic;

use super::state::SessionState;

/// Persisted metadata for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetadata {
    pub session_id: String,
    pub session_name: String,
    pub profile_name: String,
    pub working_directory: String,
    pub is_pinned: bool,
    pub is_archived: bool,
    /// Dead tmux backend; expired sessions are auto-archived
    pub is_expired: bool,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            session_id: String::new(),
            session_name: String::new(),
            profile_name: String::new(),
            working_directory: String::new(),
            is_pinned: false,
            is_archived: false,
            is_expired: false,
            last_accessed: now,
            created_at: now,
        }
    }
}

impl SessionMetadata {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            session_name: state.session_name.clone(),
            profile_name: state.profile_name.clone(),
            working_directory: state.working_directory.clone(),
            last_accessed: state.last_accessed,
            created_at: state.created,
            ..Self::default()
        }
    }
}

/// Events emitted by the metadata store.
#[derive(Debug, Clone)]
pub enum MetadataEvent {
    /// The user asked to bring an archived session back to life.
    UnarchiveRequested {
        session_id: String,
        working_directory: String,
    },
    Changed,
}

/// Persistent store for pin/archive/expired flags.
pub struct SessionMetadataStore {
    entries: RwLock<HashMap<String, SessionMetadata>>,
    file_path: PathBuf,
    tmux: TmuxDriver,
    event_tx: broadcast::Sender<MetadataEvent>,
}

impl SessionMetadataStore {
    /// Default store path: `<data-dir>/konsolai/session-metadata.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("konsolai").join("session-metadata.json"))
    }

    pub fn new(file_path: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let store = Self {
            entries: RwLock::new(HashMap::new()),
            file_path,
            tmux: TmuxDriver::new(),
            event_tx,
        };
        store.load();
        store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetadataEvent> {
        self.event_tx.subscribe()
    }

    /// Record or refresh metadata for a session.
    pub fn upsert(&self, meta: SessionMetadata) {
        if meta.session_id.is_empty() {
            return;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries
                .entry(meta.session_id.clone())
                .and_modify(|existing| {
                    existing.session_name = meta.session_name.clone();
                    existing.profile_name = meta.profile_name.clone();
                    existing.working_directory = meta.working_directory.clone();
                    existing.last_accessed = meta.last_accessed;
                })
                .or_insert(meta);
        }
        self.save();
        let _ = self.event_tx.send(MetadataEvent::Changed);
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMetadata> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(session_id).cloned())
    }

    /// All sessions, most recently accessed first.
    pub fn all_sessions(&self) -> Vec<SessionMetadata> {
        let mut sessions: Vec<SessionMetadata> = self
            .entries
            .read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        sessions
    }

    pub fn pinned_sessions(&self) -> Vec<SessionMetadata> {
        self.all_sessions()
            .into_iter()
            .filter(|m| m.is_pinned)
            .collect()
    }

    pub fn archived_sessions(&self) -> Vec<SessionMetadata> {
        self.all_sessions()
            .into_iter()
            .filter(|m| m.is_archived)
            .collect()
    }

    pub fn pin_session(&self, session_id: &str) {
        self.update(session_id, |meta| meta.is_pinned = true);
    }

    pub fn unpin_session(&self, session_id: &str) {
        self.update(session_id, |meta| meta.is_pinned = false);
    }

    /// Archive: kill the tmux backend but keep the metadata.
    pub async fn archive_session(&self, session_id: &str) {
        let session_name = self.get(session_id).map(|m| m.session_name);
        if let Some(name) = session_name {
            if !name.is_empty() {
                if let Err(err) = self.tmux.kill(&name).await {
                    warn!(session = %name, error = %err, "archive: tmux kill failed");
                }
            }
        }
        self.update(session_id, |meta| meta.is_archived = true);
    }

    /// Unarchive: clear the flag and ask the host to recreate the session
    /// in its saved working directory.
    pub fn unarchive_session(&self, session_id: &str) {
        let meta = self.get(session_id);
        self.update(session_id, |meta| {
            meta.is_archived = false;
            meta.is_expired = false;
        });
        if let Some(meta) = meta {
            let _ = self.event_tx.send(MetadataEvent::UnarchiveRequested {
                session_id: meta.session_id,
                working_directory: meta.working_directory,
            });
        }
    }

    /// Mark a session (by tmux name) as expired and auto-archive it.
    pub fn mark_expired(&self, session_name: &str) {
        let session_id = self.entries.read().ok().and_then(|entries| {
            entries
                .values()
                .find(|m| m.session_name == session_name)
                .map(|m| m.session_id.clone())
        });
        if let Some(id) = session_id {
            self.update(&id, |meta| {
                meta.is_expired = true;
                meta.is_archived = true;
            });
        }
    }

    fn update(&self, session_id: &str, mutate: impl FnOnce(&mut SessionMetadata)) {
        let mut changed = false;
        if let Ok(mut entries) = self.entries.write() {
            if let Some(meta) = entries.get_mut(session_id) {
                mutate(meta);
                changed = true;
            }
        }
        if changed {
            self.save();
            let _ = self.event_tx.send(MetadataEvent::Changed);
        }
    }

    fn load(&self) {
        let entries: Vec<SessionMetadata> = std::fs::read_to_string(&self.file_path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        if let Ok(mut map) = self.entries.write() {
            for meta in entries {
                if !meta.session_id.is_empty() {
                    map.insert(meta.session_id.clone(), meta);
                }
            }
        }
    }

    fn save(&self) {
        let sessions = self.all_sessions();
        match serde_json::to_string_pretty(&sessions) {
            Ok(text) => {
                if let Err(err) = write_atomic(&self.file_path, &text) {
                    warn!(path = %self.file_path.display(), error = %err, "metadata save failed");
                }
            }
            Err(err) => warn!(error = %err, "metadata serialization failed"),
        }
    }
}
