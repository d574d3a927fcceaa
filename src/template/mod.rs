//! Prompt templates with `{{placeholder}}` fields.
//!
//! Five builtins cover the common run shapes; user templates are JSON files
//! in a per-user directory and shadow nothing (they are appended after the
//! builtins).

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::write_atomic;

/// A prompt template.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub template_text: String,
    pub required_fields: Vec<String>,
    pub suggested_yolo_level: u8,
    pub estimated_cost_min: f64,
    pub estimated_cost_max: f64,
}

impl PromptTemplate {
    /// Fields required but missing from `fields`.
    pub fn missing_fields(&self, fields: &HashMap<String, String>) -> Vec<String> {
        self.required_fields
            .iter()
            .filter(|field| {
                fields
                    .get(*field)
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }
}

/// The built-in template set.
pub fn builtin_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate {
            id: "bugfix".to_string(),
            name: "Bug Fix".to_string(),
            template_text: "Fix {{symptom}} in {{file_path}}. Root cause: {{root_cause}}. \
                            Verify by running {{test_command}}."
                .to_string(),
            required_fields: vec![
                "symptom".to_string(),
                "file_path".to_string(),
                "root_cause".to_string(),
                "test_command".to_string(),
            ],
            suggested_yolo_level: 3,
            estimated_cost_min: 0.10,
            estimated_cost_max: 0.30,
        },
        PromptTemplate {
            id: "feature".to_string(),
            name: "Feature Add".to_string(),
            template_text: "Add {{feature}} to {{component}}. Requirements: {{requirements}}. \
                            Add tests covering: {{test_scenarios}}."
                .to_string(),
            required_fields: vec![
                "feature".to_string(),
                "component".to_string(),
                "requirements".to_string(),
                "test_scenarios".to_string(),
            ],
            suggested_yolo_level: 2,
            estimated_cost_min: 0.30,
            estimated_cost_max: 1.50,
        },
        PromptTemplate {
            id: "refactor".to_string(),
            name: "Refactor".to_string(),
            template_text: "Refactor {{target}} to use {{pattern}}. All existing tests must \
                            pass. Affected files: {{affected_files}}."
                .to_string(),
            required_fields: vec![
                "target".to_string(),
                "pattern".to_string(),
                "affected_files".to_string(),
            ],
            suggested_yolo_level: 1,
            estimated_cost_min: 0.20,
            estimated_cost_max: 0.80,
        },
        PromptTemplate {
            id: "tests".to_string(),
            name: "Test Suite".to_string(),
            template_text: "Write tests for {{component}}. Cover: {{scenarios}}. Use the \
                            existing test framework."
                .to_string(),
            required_fields: vec!["component".to_string(), "scenarios".to_string()],
            suggested_yolo_level: 3,
            estimated_cost_min: 0.15,
            estimated_cost_max: 0.50,
        },
        PromptTemplate {
            id: "gsd".to_string(),
            name: "GSD Project".to_string(),
            template_text: "Use /gsd:new-project: {{description}}".to_string(),
            required_fields: vec!["description".to_string()],
            suggested_yolo_level: 3,
            estimated_cost_min: 1.0,
            estimated_cost_max: 5.0,
        },
    ]
}

/// Global `{{key}}` substitution. Unknown placeholders are left in place.
pub fn instantiate(template: &PromptTemplate, fields: &HashMap<String, String>) -> String {
    let mut result = template.template_text.clone();
    for (key, value) in fields {
        result = result.replace(&format!("{{{{{key}}}}}"), value);
    }
    result
}

/// Manages the user template directory.
pub struct TemplateManager {
    user_dir: PathBuf,
}

impl TemplateManager {
    /// Default user template directory: `<data-dir>/konsolai/prompt-templates`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("konsolai").join("prompt-templates"))
    }

    pub fn new(user_dir: PathBuf) -> Self {
        Self { user_dir }
    }

    /// Load user templates from disk; unreadable files are skipped.
    pub fn user_templates(&self) -> Vec<PromptTemplate> {
        let entries = match std::fs::read_dir(&self.user_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut templates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<PromptTemplate>(&text).ok())
            {
                Some(template) => templates.push(template),
                None => warn!(path = %path.display(), "skipping unreadable template"),
            }
        }
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    /// Builtins followed by user templates.
    pub fn all_templates(&self) -> Vec<PromptTemplate> {
        let mut templates = builtin_templates();
        templates.extend(self.user_templates());
        templates
    }

    pub fn find(&self, id: &str) -> Option<PromptTemplate> {
        self.all_templates().into_iter().find(|t| t.id == id)
    }

    /// Save a user template as `<dir>/<id>.json`, atomically.
    pub fn save_user_template(&self, template: &PromptTemplate) -> Result<()> {
        let path = self.user_dir.join(format!("{}.json", template.id));
        let text = serde_json::to_string_pretty(template).context("serialize template")?;
        write_atomic(&path, &text)
            .with_context(|| format!("write template to {}", path.display()))
    }
}
