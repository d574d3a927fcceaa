//! Heuristic prompt quality scoring.
//!
//! Pure functions: score a prompt before dispatch, suggest fixes for weak
//! subscores, and derive yolo level / duration / cost estimates from the
//! grade. No tokens are spent.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Grade buckets derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    TooVague,
    NeedsWork,
    Good,
    Excellent,
}

impl Grade {
    pub fn from_score(score: u8) -> Self {
        if score >= 75 {
            Grade::Excellent
        } else if score >= 50 {
            Grade::Good
        } else if score >= 25 {
            Grade::NeedsWork
        } else {
            Grade::TooVague
        }
    }
}

/// Result of assessing one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptAssessment {
    /// 0-100
    pub score: u8,
    pub grade: Grade,
    pub suggestions: Vec<String>,
    pub detected_files: Vec<String>,
    /// 1-3
    pub suggested_yolo_level: u8,
    pub estimated_duration_minutes: u32,
    #[serde(rename = "estimatedCostUSD")]
    pub estimated_cost_usd: f64,
}

static FILE_PATH_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\b(?:src|lib|test|tests|bin|include)/[\w/.+-]+)|(?:[\w/.-]+\.(?:cpp|h|hpp|py|ts|js|json|yaml|yml|toml|cmake|txt|md|rs|go|java|xml|qml))\b",
    )
    .expect("file path pattern")
});

static CAMEL_CASE_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+(?:[A-Z][a-z]+)+\b").expect("camel case pattern"));

static FILE_LIST_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\w/.-]+\.(?:cpp|h|py),\s*[\w/.-]+\.(?:cpp|h|py)").expect("file list pattern")
});

const ACCEPTANCE_KEYWORDS: &[&str] = &[
    "build", "test", "pass", "verify", "assert", "compile", "check", "ensure",
];

const SCOPE_KEYWORDS: &[&str] = &["only", "just", "limited to", "single", "specific"];

const ACTION_VERBS: &[&str] = &[
    "fix", "add", "implement", "refactor", "create", "update", "remove", "move",
];

const VAGUE_TERMS: &[&str] = &["improve", "make better", "clean up", "somehow", "maybe"];

/// Assess a prompt against the working directory it will run in.
pub fn assess(prompt: &str, working_dir: &str) -> PromptAssessment {
    if prompt.trim().is_empty() {
        return PromptAssessment {
            score: 0,
            grade: Grade::TooVague,
            suggestions: generate_suggestions(0, 0, 0, 0, 0),
            detected_files: Vec::new(),
            suggested_yolo_level: 1,
            estimated_duration_minutes: 60,
            estimated_cost_usd: 1.20,
        };
    }

    let (file_score, detected_files) = score_file_paths(prompt);
    let accept_score = score_acceptance_criteria(prompt);
    let scope_score = score_bounded_scope(prompt);
    let clarity_score = score_clarity(prompt);
    let structure_score = score_structure(prompt);

    let mut score =
        (file_score + accept_score + scope_score + clarity_score + structure_score).min(100) as u8;

    // Projects carrying agent instructions tend to run smoother.
    if !working_dir.is_empty() && Path::new(working_dir).join("CLAUDE.md").exists() {
        score = score.saturating_add(5).min(100);
    }

    let grade = Grade::from_score(score);
    PromptAssessment {
        score,
        grade,
        suggestions: generate_suggestions(
            file_score,
            accept_score,
            scope_score,
            clarity_score,
            structure_score,
        ),
        detected_files,
        suggested_yolo_level: estimate_yolo_level(grade),
        estimated_duration_minutes: estimate_duration(grade),
        estimated_cost_usd: estimate_cost(grade),
    }
}

/// File/class references: 0/10/18/25 for 0/1/2/3+ unique references.
fn score_file_paths(prompt: &str) -> (i32, Vec<String>) {
    let mut detected = Vec::new();

    for m in FILE_PATH_RX.find_iter(prompt) {
        let path = m.as_str().to_string();
        if !detected.contains(&path) {
            detected.push(path);
        }
    }
    for m in CAMEL_CASE_RX.find_iter(prompt) {
        let token = m.as_str().to_string();
        if !detected.contains(&token) {
            detected.push(token);
        }
    }

    let score = match detected.len() {
        0 => 0,
        1 => 10,
        2 => 18,
        _ => 25,
    };
    (score, detected)
}

/// Acceptance criteria keywords: 0/10/18/25 for 0/1/2/3+ matches.
fn score_acceptance_criteria(prompt: &str) -> i32 {
    let lower = prompt.to_lowercase();
    let matches = ACCEPTANCE_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .count();
    match matches {
        0 => 0,
        1 => 10,
        2 => 18,
        _ => 25,
    }
}

/// Scope-bounding keywords plus explicit file lists: 0/8/14/20.
fn score_bounded_scope(prompt: &str) -> i32 {
    let lower = prompt.to_lowercase();
    let mut matches = SCOPE_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .count();
    if FILE_LIST_RX.is_match(prompt) {
        matches += 2;
    }
    match matches {
        0 => 0,
        1 => 8,
        2 => 14,
        _ => 20,
    }
}

/// Action verbs minus vague terms, plus a length bonus; clamped to [0, 15].
fn score_clarity(prompt: &str) -> i32 {
    let lower = prompt.to_lowercase();
    let mut score = 0;

    let verb_count = ACTION_VERBS.iter().filter(|v| lower.contains(*v)).count() as i32;
    score += (verb_count * 5).min(10);

    for term in VAGUE_TERMS {
        if lower.contains(term) {
            score -= 3;
        }
    }

    if prompt.len() > 20 {
        score += 5;
    }

    score.clamp(0, 15)
}

/// Length bucket plus sentence punctuation; clamped to [0, 15].
fn score_structure(prompt: &str) -> i32 {
    let len = prompt.trim().len();
    let mut score = 0;

    if (50..=2000).contains(&len) {
        score += 10;
    } else if (30..50).contains(&len) {
        score += 5;
    } else if len > 2000 {
        score += 7;
    }

    if prompt.contains('.') || prompt.contains(':') || prompt.contains(',') {
        score += 5;
    }

    score.clamp(0, 15)
}

fn generate_suggestions(
    file_score: i32,
    accept_score: i32,
    scope_score: i32,
    clarity_score: i32,
    structure_score: i32,
) -> Vec<String> {
    let mut suggestions = Vec::new();
    if file_score < 10 {
        suggestions.push("Mention specific files or classes to target".to_string());
    }
    if accept_score < 10 {
        suggestions.push("Add acceptance criteria (e.g. 'verify by running the tests')".to_string());
    }
    if scope_score < 8 {
        suggestions.push("Bound the scope (e.g. 'only modify src/session/')".to_string());
    }
    if clarity_score < 5 {
        suggestions.push("Use clear action verbs (fix, add, implement, refactor)".to_string());
    }
    if structure_score < 5 {
        suggestions.push(
            "Add more detail, aiming for 50-2000 characters with sentence structure".to_string(),
        );
    }
    suggestions
}

/// Grade → suggested autonomy level.
pub fn estimate_yolo_level(grade: Grade) -> u8 {
    match grade {
        Grade::Excellent => 3,
        Grade::Good => 2,
        Grade::NeedsWork | Grade::TooVague => 1,
    }
}

/// Grade → estimated duration in minutes.
fn estimate_duration(grade: Grade) -> u32 {
    match grade {
        Grade::Excellent => 10,
        Grade::Good => 15,
        Grade::NeedsWork => 30,
        Grade::TooVague => 60,
    }
}

/// Proportional to duration at $0.02 per minute.
fn estimate_cost(grade: Grade) -> f64 {
    estimate_duration(grade) as f64 * 0.02
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prompt_is_too_vague() {
        for prompt in ["", "   ", "\n\t"] {
            let a = assess(prompt, "");
            assert_eq!(a.score, 0);
            assert_eq!(a.grade, Grade::TooVague);
            assert_eq!(a.suggested_yolo_level, 1);
            assert_eq!(a.estimated_duration_minutes, 60);
            assert!((a.estimated_cost_usd - 1.20).abs() < 1e-9);
            assert!(!a.suggestions.is_empty());
        }
    }

    #[test]
    fn rich_prompt_scores_well() {
        let prompt = "Fix the null pointer crash in src/foo/Bar.cpp when send() is called \
                      with empty string. Verify by running ctest.";
        let a = assess(prompt, "");
        assert!(a.score >= 50, "score was {}", a.score);
        assert!(matches!(a.grade, Grade::Excellent | Grade::Good));
        assert!(a.detected_files.iter().any(|f| f == "src/foo/Bar.cpp"));
    }

    #[test]
    fn score_is_bounded() {
        let prompt = "Fix and test and verify and check src/a.rs, src/b.rs, src/c.rs only, \
                      just the specific single files listed. Ensure the build passes, assert \
                      the tests compile. Implement, refactor, update, create, remove, move.";
        let a = assess(prompt, "");
        assert!(a.score <= 100);
        assert_eq!(a.grade, Grade::Excellent);
    }

    #[test]
    fn grade_is_monotone_in_score() {
        let mut last = Grade::TooVague;
        for score in 0..=100 {
            let grade = Grade::from_score(score);
            assert!(grade >= last);
            last = grade;
        }
        assert_eq!(Grade::from_score(24), Grade::TooVague);
        assert_eq!(Grade::from_score(25), Grade::NeedsWork);
        assert_eq!(Grade::from_score(50), Grade::Good);
        assert_eq!(Grade::from_score(75), Grade::Excellent);
    }

    #[test]
    fn yolo_level_always_valid() {
        for grade in [
            Grade::TooVague,
            Grade::NeedsWork,
            Grade::Good,
            Grade::Excellent,
        ] {
            assert!((1..=3).contains(&estimate_yolo_level(grade)));
        }
    }

    #[test]
    fn camel_case_tokens_are_detected() {
        let (score, detected) = score_file_paths("Refactor the SessionObserver and TmuxManager");
        assert_eq!(score, 18);
        assert!(detected.contains(&"SessionObserver".to_string()));
        assert!(detected.contains(&"TmuxManager".to_string()));
    }

    #[test]
    fn duplicate_references_count_once() {
        let (score, detected) = score_file_paths("src/main.rs then src/main.rs again");
        assert_eq!(detected.len(), 1);
        assert_eq!(score, 10);
    }

    #[test]
    fn acceptance_keyword_buckets() {
        assert_eq!(score_acceptance_criteria("do things"), 0);
        assert_eq!(score_acceptance_criteria("make the build work"), 10);
        assert_eq!(score_acceptance_criteria("build it and test it"), 18);
        assert_eq!(
            score_acceptance_criteria("build, test, and verify everything"),
            25
        );
    }

    #[test]
    fn scope_file_list_bonus() {
        // A comma-separated file list alone counts as two scope matches.
        assert_eq!(score_bounded_scope("edit foo.cpp, bar.cpp"), 14);
        assert_eq!(score_bounded_scope("only edit foo.cpp, bar.cpp"), 20);
        assert_eq!(score_bounded_scope("whatever feels right"), 0);
    }

    #[test]
    fn vague_terms_penalize_clarity() {
        let clear = score_clarity("fix the parser and add a regression test");
        let vague = score_clarity("improve things somehow, maybe clean up a bit");
        assert!(clear > vague);
        assert!(vague >= 0);
    }

    #[test]
    fn structure_length_buckets() {
        assert_eq!(score_structure("tiny"), 0);
        let medium = "a".repeat(40);
        assert_eq!(score_structure(&medium), 5);
        let sweet = format!("{}.", "a".repeat(60));
        assert_eq!(score_structure(&sweet), 15);
        let huge = format!("{}.", "a".repeat(2500));
        assert_eq!(score_structure(&huge), 12);
    }

    #[test]
    fn claude_md_bonus_applies() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = "Fix the crash in src/foo/bar.rs and verify with tests.";
        let without = assess(prompt, dir.path().to_str().unwrap());

        std::fs::write(dir.path().join("CLAUDE.md"), "# notes").unwrap();
        let with = assess(prompt, dir.path().to_str().unwrap());
        assert_eq!(with.score, without.score + 5);
    }

    #[test]
    fn suggestions_target_weak_subscores() {
        let a = assess("do stuff", "");
        assert!(a
            .suggestions
            .iter()
            .any(|s| s.contains("specific files")));
        assert!(a
            .suggestions
            .iter()
            .any(|s| s.contains("acceptance criteria")));

        let strong = assess(
            "Fix the crash in src/foo/Bar.cpp only; verify by running the test suite and \
             check the build passes.",
            "",
        );
        assert!(strong.suggestions.len() < a.suggestions.len());
    }
}
