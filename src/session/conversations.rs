//! Reader for the Claude CLI's per-project conversation index.
//!
//! The CLI keeps `~/.claude/projects/<mangled-path>/sessions-index.json`, a
//! bare JSON array of conversation entries. The mangled directory name is the
//! absolute project path with `/` replaced by `-`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One conversation entry from sessions-index.json.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaudeConversation {
    /// Conversation UUID, passed to `claude --resume`
    pub session_id: String,
    pub summary: String,
    pub first_prompt: String,
    pub message_count: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl ClaudeConversation {
    /// Display title: summary, else first prompt, else a placeholder;
    /// truncated for list views.
    pub fn display_title(&self) -> String {
        let text = if !self.summary.is_empty() {
            self.summary.as_str()
        } else if !self.first_prompt.is_empty() {
            self.first_prompt.as_str()
        } else {
            "(no summary)"
        };
        if text.chars().count() > 120 {
            let truncated: String = text.chars().take(117).collect();
            format!("{truncated}...")
        } else {
            text.to_string()
        }
    }
}

/// Mangle an absolute project path into the CLI's directory name.
fn mangle_project_path(project_path: &Path) -> String {
    project_path.to_string_lossy().replace('/', "-")
}

/// The directory the CLI stores this project's conversation data in.
pub fn project_index_dir(project_path: &Path) -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".claude")
            .join("projects")
            .join(mangle_project_path(project_path))
    })
}

/// Read conversation history for a project, most recently modified first.
///
/// Any failure (missing file, malformed JSON) reads as "no conversations".
pub fn read_claude_conversations(project_path: &Path) -> Vec<ClaudeConversation> {
    let index_path = match project_index_dir(project_path) {
        Some(dir) => dir.join("sessions-index.json"),
        None => return Vec::new(),
    };
    read_conversations_index(&index_path)
}

/// Read and sort a sessions-index.json file.
pub fn read_conversations_index(index_path: &Path) -> Vec<ClaudeConversation> {
    let mut conversations: Vec<ClaudeConversation> = std::fs::read_to_string(index_path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();
    conversations.sort_by(|a, b| b.modified.cmp(&a.modified));
    conversations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangled_path_has_no_slashes() {
        let mangled = mangle_project_path(Path::new("/home/user/projects/myapp"));
        assert_eq!(mangled, "-home-user-projects-myapp");
    }

    #[test]
    fn index_sorted_by_modified_descending() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("sessions-index.json");
        std::fs::write(
            &index,
            r#"[
                {"sessionId":"old","summary":"older","messageCount":3,
                 "created":"2025-05-01T10:00:00Z","modified":"2025-05-01T11:00:00Z"},
                {"sessionId":"new","summary":"newer","messageCount":9,
                 "created":"2025-06-01T10:00:00Z","modified":"2025-06-02T09:30:00Z"}
            ]"#,
        )
        .unwrap();

        let conversations = read_conversations_index(&index);
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].session_id, "new");
        assert_eq!(conversations[1].session_id, "old");
        assert_eq!(conversations[0].message_count, 9);
    }

    #[test]
    fn malformed_index_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("sessions-index.json");
        std::fs::write(&index, "{not an array}").unwrap();
        assert!(read_conversations_index(&index).is_empty());
        assert!(read_conversations_index(&dir.path().join("missing.json")).is_empty());
    }

    #[test]
    fn display_title_fallbacks() {
        let mut conv = ClaudeConversation::default();
        assert_eq!(conv.display_title(), "(no summary)");

        conv.first_prompt = "fix the tests".to_string();
        assert_eq!(conv.display_title(), "fix the tests");

        conv.summary = "Test fixing session".to_string();
        assert_eq!(conv.display_title(), "Test fixing session");

        conv.summary = "x".repeat(200);
        let title = conv.display_title();
        assert_eq!(title.chars().count(), 120);
        assert!(title.ends_with("..."));
    }
}
