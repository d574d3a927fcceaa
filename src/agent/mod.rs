//! Agent-side domain model: state, token accounting, approvals.

pub mod detect;
pub mod model;
pub mod state;

pub use detect::{detect_idle_prompt, detect_permission_prompt};
pub use model::AgentModel;
pub use state::{AgentSignal, AgentStateMachine};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// The six-state agent model derived from hook events and pane scraping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgentState {
    /// No agent process in the session (initial and terminal state)
    #[default]
    NotRunning,
    Starting,
    Idle,
    Working,
    WaitingInput,
    Error,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AgentState::NotRunning => "NotRunning",
            AgentState::Starting => "Starting",
            AgentState::Idle => "Idle",
            AgentState::Working => "Working",
            AgentState::WaitingInput => "WaitingInput",
            AgentState::Error => "Error",
        };
        write!(f, "{label}")
    }
}

/// Per-session token usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    /// Estimated cost in USD at Anthropic per-million pricing (Claude Opus 4.5).
    pub fn estimated_cost_usd(&self) -> f64 {
        (self.input_tokens as f64 * 3.0
            + self.output_tokens as f64 * 15.0
            + self.cache_creation_tokens as f64 * 0.30
            + self.cache_read_tokens as f64 * 0.30)
            / 1_000_000.0
    }

    /// Compact display like "1.2M↑ 15.3K↓" (input+cache up, output down).
    pub fn format_compact(&self) -> String {
        fn fmt(n: u64) -> String {
            if n >= 1_000_000 {
                format!("{:.1}M", n as f64 / 1_000_000.0)
            } else if n >= 1_000 {
                format!("{:.1}K", n as f64 / 1_000.0)
            } else {
                n.to_string()
            }
        }
        let up = self.input_tokens + self.cache_read_tokens + self.cache_creation_tokens;
        format!("{}\u{2191} {}\u{2193}", fmt(up), fmt(self.output_tokens))
    }
}

/// Log entry for an auto-approved action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalLogEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub action: String,
    /// 1=yolo, 2=double, 3=triple
    pub yolo_level: u8,
}

/// Append-only, totally ordered per-session approval log.
///
/// Appends are broadcast as they land; the per-level counters are recomputed
/// from the log on every append.
pub struct ApprovalLog {
    entries: RwLock<Vec<ApprovalLogEntry>>,
    yolo_count: AtomicUsize,
    double_count: AtomicUsize,
    triple_count: AtomicUsize,
    event_tx: broadcast::Sender<ApprovalLogEntry>,
}

impl Default for ApprovalLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalLog {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            entries: RwLock::new(Vec::new()),
            yolo_count: AtomicUsize::new(0),
            double_count: AtomicUsize::new(0),
            triple_count: AtomicUsize::new(0),
            event_tx,
        }
    }

    /// Append an approval and broadcast it.
    pub fn log(&self, tool_name: &str, action: &str, yolo_level: u8) -> ApprovalLogEntry {
        let entry = ApprovalLogEntry {
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            action: action.to_string(),
            yolo_level,
        };

        {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.push(entry.clone());

            let mut counts = [0usize; 3];
            for e in entries.iter() {
                if (1..=3).contains(&e.yolo_level) {
                    counts[(e.yolo_level - 1) as usize] += 1;
                }
            }
            self.yolo_count.store(counts[0], Ordering::Relaxed);
            self.double_count.store(counts[1], Ordering::Relaxed);
            self.triple_count.store(counts[2], Ordering::Relaxed);
        }

        debug!(
            tool = tool_name,
            action, level = yolo_level, "logged approval"
        );
        let _ = self.event_tx.send(entry.clone());
        entry
    }

    pub fn yolo_count(&self) -> usize {
        self.yolo_count.load(Ordering::Relaxed)
    }

    pub fn double_count(&self) -> usize {
        self.double_count.load(Ordering::Relaxed)
    }

    pub fn triple_count(&self) -> usize {
        self.triple_count.load(Ordering::Relaxed)
    }

    pub fn total_count(&self) -> usize {
        self.yolo_count() + self.double_count() + self.triple_count()
    }

    /// Snapshot of the log in append order.
    pub fn entries(&self) -> Vec<ApprovalLogEntry> {
        self.entries
            .read()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalLogEntry> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_total_and_cost() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            cache_read_tokens: 500_000,
            cache_creation_tokens: 200_000,
        };
        assert_eq!(usage.total_tokens(), 1_800_000);

        // 3.0 + 1.5 + 0.06 + 0.15
        let cost = usage.estimated_cost_usd();
        assert!((cost - 4.71).abs() < 1e-9);
    }

    #[test]
    fn token_usage_zero_cost() {
        assert_eq!(TokenUsage::default().estimated_cost_usd(), 0.0);
    }

    #[test]
    fn token_usage_compact_format() {
        let usage = TokenUsage {
            input_tokens: 1_200_000,
            output_tokens: 15_300,
            ..Default::default()
        };
        assert_eq!(usage.format_compact(), "1.2M\u{2191} 15.3K\u{2193}");
    }

    #[test]
    fn approval_log_counts_per_level() {
        let log = ApprovalLog::new();
        log.log("Bash", "auto-approved", 1);
        log.log("Bash", "auto-approved", 1);
        log.log("unknown", "auto-accepted", 2);
        log.log("unknown", "auto-continued", 3);

        assert_eq!(log.yolo_count(), 2);
        assert_eq!(log.double_count(), 1);
        assert_eq!(log.triple_count(), 1);
        assert_eq!(log.total_count(), 4);
        assert_eq!(log.entries().len(), 4);
    }

    #[tokio::test]
    async fn approval_log_broadcasts_in_order() {
        let log = ApprovalLog::new();
        let mut rx = log.subscribe();
        log.log("Read", "auto-approved", 1);
        log.log("Edit", "auto-approved", 1);

        assert_eq!(rx.recv().await.unwrap().tool_name, "Read");
        assert_eq!(rx.recv().await.unwrap().tool_name, "Edit");
    }
}
