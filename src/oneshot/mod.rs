//! Fire-and-forget orchestration of a single agent run.
//!
//! Attaches to a session (non-owning), installs autonomy levels and budget,
//! submits the configured prompt on the first idle, and collects a result
//! when the agent exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::AgentState;
use crate::budget::{BudgetEvent, SessionBudget};
use crate::session::{ClaudeSession, SessionEvent};

/// Lightning bolt shown per active yolo level in state labels.
const YOLO_BOLT: char = '\u{03DF}'; // ϟ

/// Configuration for a one-shot run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OneShotConfig {
    pub prompt: String,
    pub working_dir: String,
    pub model: String,
    pub time_limit_minutes: u32,
    #[serde(rename = "costCeilingUSD")]
    pub cost_ceiling_usd: f64,
    pub token_ceiling: u64,
    /// 1=L1, 2=L1+L2, 3=L1+L2+L3
    pub yolo_level: u8,
    pub use_gsd: bool,
    pub quality_score: u8,
}

impl Default for OneShotConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            working_dir: String::new(),
            model: String::new(),
            time_limit_minutes: 0,
            cost_ceiling_usd: 0.0,
            token_ceiling: 0,
            yolo_level: 3,
            use_gsd: false,
            quality_score: 0,
        }
    }
}

impl OneShotConfig {
    fn has_any_limit(&self) -> bool {
        self.time_limit_minutes > 0 || self.cost_ceiling_usd > 0.0 || self.token_ceiling > 0
    }
}

/// Result of a completed one-shot run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OneShotResult {
    pub success: bool,
    pub summary: String,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
    pub duration_seconds: i64,
    pub total_tokens: u64,
    pub files_modified: u32,
    pub commits: u32,
    pub errors: Vec<String>,
}

/// Events emitted while a one-shot run progresses.
#[derive(Debug, Clone)]
pub enum OneShotEvent {
    PromptSent,
    BudgetStatusChanged(String),
    Completed(OneShotResult),
}

/// Orchestrates one non-interactive run against a session it monitors but
/// does not own.
pub struct OneShotController {
    id: Uuid,
    config: OneShotConfig,
    session: Mutex<Option<Arc<ClaudeSession>>>,
    result: Mutex<OneShotResult>,
    running: AtomicBool,
    prompt_sent: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    event_tx: broadcast::Sender<OneShotEvent>,
    cancel: CancellationToken,
}

impl OneShotController {
    pub fn new(config: OneShotConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            id: Uuid::new_v4(),
            config,
            session: Mutex::new(None),
            result: Mutex::new(OneShotResult::default()),
            running: AtomicBool::new(false),
            prompt_sent: AtomicBool::new(false),
            started_at: Mutex::new(None),
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &OneShotConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OneShotEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn result(&self) -> OneShotResult {
        self.result
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Attach to a session: set autonomy levels, install the budget, and
    /// subscribe to its events.
    pub fn attach_to_session(self: &Arc<Self>, session: &Arc<ClaudeSession>) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = Some(Arc::clone(session));
        }

        // Levels are cumulative: 3 means L1+L2+L3.
        let autonomy = session.autonomy();
        autonomy.set_yolo(self.config.yolo_level >= 1);
        autonomy.set_double_yolo(self.config.yolo_level >= 2);
        autonomy.set_triple_yolo(self.config.yolo_level >= 3);

        if self.config.has_any_limit() {
            session.budget_controller().set_budget(SessionBudget {
                time_limit_minutes: self.config.time_limit_minutes,
                cost_ceiling_usd: self.config.cost_ceiling_usd,
                token_ceiling: self.config.token_ceiling,
                started_at: Some(Utc::now()),
                ..SessionBudget::default()
            });
        }

        let controller = Arc::clone(self);
        let mut rx = session.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => controller.on_session_event(&event).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        debug!(id = %self.id, session = %session.session_name(),
            yolo_level = self.config.yolo_level, "one-shot attached");
    }

    /// Begin monitoring; the prompt goes out on the first idle.
    pub fn start(&self) {
        self.running.store(true, Ordering::Relaxed);
        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Utc::now());
        }
        debug!(id = %self.id, "one-shot started");
    }

    async fn on_session_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => self.on_state_changed(*state).await,
            SessionEvent::Budget(BudgetEvent::Warning { .. }) => {
                let _ = self
                    .event_tx
                    .send(OneShotEvent::BudgetStatusChanged(self.format_budget_status()));
            }
            SessionEvent::Budget(BudgetEvent::Exceeded { kind }) => {
                if let Ok(mut result) = self.result.lock() {
                    result.errors.push(format!("Budget exceeded: {kind}"));
                }
                let _ = self
                    .event_tx
                    .send(OneShotEvent::BudgetStatusChanged(self.format_budget_status()));
            }
            _ => {}
        }
    }

    async fn on_state_changed(&self, state: AgentState) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let Some(session) = self.session.lock().ok().and_then(|s| s.clone()) else {
            return;
        };

        if state == AgentState::Idle && !self.prompt_sent.load(Ordering::Relaxed) {
            // First idle: dispatch the configured prompt.
            let prompt = if self.config.use_gsd {
                format!("Use /gsd:new-project: {}", self.config.prompt)
            } else {
                self.config.prompt.clone()
            };
            if session.send_prompt(&prompt).await.is_ok() {
                self.prompt_sent.store(true, Ordering::Relaxed);
                info!(id = %self.id, "one-shot prompt sent");
                let _ = self.event_tx.send(OneShotEvent::PromptSent);
            }
            return;
        }

        if state == AgentState::NotRunning && self.prompt_sent.load(Ordering::Relaxed) {
            // Agent exited: finalize.
            if self.running.swap(false, Ordering::Relaxed) {
                let usage = session.token_usage();
                let duration = self
                    .started_at
                    .lock()
                    .ok()
                    .and_then(|s| *s)
                    .map(|started| (Utc::now() - started).num_seconds())
                    .unwrap_or(0);

                let result = {
                    let mut result = self
                        .result
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    result.total_tokens = usage.total_tokens();
                    result.cost_usd = usage.estimated_cost_usd();
                    result.duration_seconds = duration;
                    result.success = result.errors.is_empty();
                    result.clone()
                };

                info!(id = %self.id, success = result.success, cost = result.cost_usd,
                    tokens = result.total_tokens, duration = result.duration_seconds,
                    "one-shot completed");
                let _ = self.event_tx.send(OneShotEvent::Completed(result));
                self.cancel.cancel();
            }
        }

        let _ = self
            .event_tx
            .send(OneShotEvent::BudgetStatusChanged(self.format_budget_status()));
    }

    /// Render "3:24 / 15:00 | $0.14 / $0.50"; limit parts are dropped when
    /// the corresponding ceiling is unset.
    pub fn format_budget_status(&self) -> String {
        let Some(started) = self.started_at.lock().ok().and_then(|s| *s) else {
            return String::new();
        };
        let Some(session) = self.session.lock().ok().and_then(|s| s.clone()) else {
            return String::new();
        };

        let elapsed_secs = (Utc::now() - started).num_seconds().max(0);
        let elapsed = format!("{}:{:02}", elapsed_secs / 60, elapsed_secs % 60);

        let mut parts = Vec::new();
        if self.config.time_limit_minutes > 0 {
            let limit_secs = self.config.time_limit_minutes as i64 * 60;
            parts.push(format!(
                "{elapsed} / {}:{:02}",
                limit_secs / 60,
                limit_secs % 60
            ));
        } else {
            parts.push(elapsed);
        }

        let cost = session.token_usage().estimated_cost_usd();
        if self.config.cost_ceiling_usd > 0.0 {
            parts.push(format!("${cost:.2} / ${:.2}", self.config.cost_ceiling_usd));
        } else {
            parts.push(format!("${cost:.2}"));
        }

        parts.join(" | ")
    }

    /// Render a state label like "Working ϟϟϟ [7]".
    pub fn format_state_label(&self) -> String {
        let Some(session) = self.session.lock().ok().and_then(|s| s.clone()) else {
            return "No session".to_string();
        };

        match session.state() {
            AgentState::NotRunning => "Stopped".to_string(),
            AgentState::Starting => "Starting...".to_string(),
            AgentState::Idle => "Idle".to_string(),
            AgentState::WaitingInput => "Waiting for input".to_string(),
            AgentState::Error => "Error".to_string(),
            AgentState::Working => {
                let autonomy = session.autonomy();
                let mut bolts = String::new();
                if autonomy.yolo() {
                    bolts.push(YOLO_BOLT);
                }
                if autonomy.double_yolo() {
                    bolts.push(YOLO_BOLT);
                }
                if autonomy.triple_yolo() {
                    bolts.push(YOLO_BOLT);
                }

                let mut label = "Working".to_string();
                if !bolts.is_empty() {
                    label.push(' ');
                    label.push_str(&bolts);
                }
                let approvals = session.approvals().total_count();
                if approvals > 0 {
                    label.push_str(&format!(" [{approvals}]"));
                }
                label
            }
        }
    }
}
