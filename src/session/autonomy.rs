//! Tiered autonomy (yolo) engine.
//!
//! Three orthogonal per-session levels:
//! - L1 (yolo): auto-approve permission prompts
//! - L2 (double): auto-accept suggestions on idle (Tab + Enter)
//! - L3 (triple): auto-continue on idle with a configured prompt
//!
//! Actions are deferred through short timers rather than fired inside signal
//! handlers, and every action is gated by the budget controller and by
//! observer interventions. While L1 is on, a sentinel file next to the hook
//! socket lets the sidecar pre-approve without a round-trip.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use konsolai_hooks::paths::yolo_sentinel_path;

use crate::agent::{detect_permission_prompt, AgentSignal, AgentState, AgentStateMachine, ApprovalLog};
use crate::budget::BudgetController;
use crate::settings::DEFAULT_AUTO_CONTINUE_PROMPT;
use crate::tmux::TmuxDriver;

/// Delay before approving a hook-reported permission prompt.
const HOOK_APPROVE_DELAY: Duration = Duration::from_millis(100);
/// Pane polling cadence while L1 is on.
const POLL_INTERVAL: Duration = Duration::from_millis(300);
/// Delay between poll detection and the approval keystroke.
const POLL_APPROVE_DELAY: Duration = Duration::from_millis(50);
/// Suppression window against re-triggering on stale pane content.
const POLL_COOLDOWN: Duration = Duration::from_secs(2);
/// Delay before the L2 suggestion attempt on idle.
const SUGGESTION_DELAY: Duration = Duration::from_millis(1000);
/// Gap between Tab and Enter in the L2 sequence.
const TAB_ENTER_GAP: Duration = Duration::from_millis(100);
/// Delay before the L3 auto-continue on idle.
const CONTINUE_DELAY: Duration = Duration::from_millis(500);
/// Delay before firing when a level is enabled with the trigger already met.
const ENABLE_FIRE_DELAY: Duration = Duration::from_millis(500);
/// After an L2 attempt, how long to wait before checking whether L3 should
/// take over because the agent is still idle.
const SUGGESTION_FALLBACK_DELAY: Duration = Duration::from_secs(3);
/// Idle-prompt pane scrape cadence while L3 is on.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Suppression window after a scraped idle detection.
const IDLE_POLL_COOLDOWN: Duration = Duration::from_secs(5);

/// Per-session autonomy engine.
pub struct AutonomyEngine {
    session_name: String,
    tmux: TmuxDriver,
    socket_path: PathBuf,
    machine: Arc<AgentStateMachine>,
    budget: Arc<BudgetController>,
    approvals: Arc<ApprovalLog>,

    yolo: AtomicBool,
    double_yolo: AtomicBool,
    triple_yolo: AtomicBool,
    try_suggestions_first: AtomicBool,
    auto_continue_prompt: RwLock<String>,
    /// Set while an observer intervention (Pause/Adjust/Redirect) is active.
    intervention_block: AtomicBool,

    poll_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    prompt_detected: Arc<AtomicBool>,
    idle_poll_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    idle_detected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl AutonomyEngine {
    pub fn new(
        session_name: String,
        tmux: TmuxDriver,
        socket_path: PathBuf,
        machine: Arc<AgentStateMachine>,
        budget: Arc<BudgetController>,
        approvals: Arc<ApprovalLog>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_name,
            tmux,
            socket_path,
            machine,
            budget,
            approvals,
            yolo: AtomicBool::new(false),
            double_yolo: AtomicBool::new(false),
            triple_yolo: AtomicBool::new(false),
            try_suggestions_first: AtomicBool::new(true),
            auto_continue_prompt: RwLock::new(DEFAULT_AUTO_CONTINUE_PROMPT.to_string()),
            intervention_block: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            prompt_detected: Arc::new(AtomicBool::new(false)),
            idle_poll_task: Mutex::new(None),
            idle_detected: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    // --- Level getters/setters ---

    pub fn yolo(&self) -> bool {
        self.yolo.load(Ordering::Relaxed)
    }

    pub fn double_yolo(&self) -> bool {
        self.double_yolo.load(Ordering::Relaxed)
    }

    pub fn triple_yolo(&self) -> bool {
        self.triple_yolo.load(Ordering::Relaxed)
    }

    pub fn try_suggestions_first(&self) -> bool {
        self.try_suggestions_first.load(Ordering::Relaxed)
    }

    pub fn set_try_suggestions_first(&self, enabled: bool) {
        self.try_suggestions_first.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_continue_prompt(&self) -> String {
        self.auto_continue_prompt
            .read()
            .map(|p| p.clone())
            .unwrap_or_else(|_| DEFAULT_AUTO_CONTINUE_PROMPT.to_string())
    }

    pub fn set_auto_continue_prompt(&self, prompt: &str) {
        if let Ok(mut guard) = self.auto_continue_prompt.write() {
            *guard = prompt.to_string();
        }
    }

    /// Seed levels without side effects (used at construction from settings;
    /// the sentinel and polling start with the session).
    pub fn preset(&self, yolo: bool, double_yolo: bool, triple_yolo: bool) {
        self.yolo.store(yolo, Ordering::Relaxed);
        self.double_yolo.store(double_yolo, Ordering::Relaxed);
        self.triple_yolo.store(triple_yolo, Ordering::Relaxed);
    }

    /// Toggle L1. Enabling while a permission prompt is already showing
    /// approves it immediately.
    pub fn set_yolo(self: &Arc<Self>, enabled: bool) {
        if self.yolo.swap(enabled, Ordering::Relaxed) == enabled {
            return;
        }
        if enabled {
            self.write_sentinel();
            self.start_permission_polling();

            if self.machine.state() == AgentState::WaitingInput && !self.blocked() {
                let engine = Arc::clone(self);
                self.spawn_guarded(async move {
                    tokio::time::sleep(HOOK_APPROVE_DELAY).await;
                    engine.approve("unknown", "auto-approved").await;
                });
            }
        } else {
            self.remove_sentinel();
            self.stop_permission_polling();
        }
    }

    /// Toggle L2. Enabling while already idle (and L3 off) accepts now.
    pub fn set_double_yolo(self: &Arc<Self>, enabled: bool) {
        if self.double_yolo.swap(enabled, Ordering::Relaxed) == enabled {
            return;
        }
        if enabled
            && !self.triple_yolo()
            && self.machine.state() == AgentState::Idle
            && !self.blocked()
        {
            let engine = Arc::clone(self);
            self.spawn_guarded(async move {
                tokio::time::sleep(ENABLE_FIRE_DELAY).await;
                engine.accept_suggestion().await;
            });
        }
    }

    /// Toggle L3. Enabling while already idle continues now.
    pub fn set_triple_yolo(self: &Arc<Self>, enabled: bool) {
        if self.triple_yolo.swap(enabled, Ordering::Relaxed) == enabled {
            return;
        }
        if enabled {
            self.start_idle_polling();
            if self.machine.state() == AgentState::Idle && !self.blocked() {
                let engine = Arc::clone(self);
                self.spawn_guarded(async move {
                    tokio::time::sleep(ENABLE_FIRE_DELAY).await;
                    engine.auto_continue().await;
                });
            }
        } else {
            self.stop_idle_polling();
        }
    }

    /// Block/unblock autonomy on behalf of the observer.
    pub fn set_intervention_block(&self, blocked: bool) {
        self.intervention_block.store(blocked, Ordering::Relaxed);
    }

    /// No autonomy action fires while this is true.
    pub fn blocked(&self) -> bool {
        self.intervention_block.load(Ordering::Relaxed) || self.budget.should_block_yolo()
    }

    // --- Signal handling ---

    /// React to one agent signal. Called from the session's dispatch task.
    pub fn handle_signal(self: &Arc<Self>, signal: &AgentSignal) {
        match signal {
            AgentSignal::PermissionRequested { tool_name, .. } => {
                if self.yolo() && !self.blocked() {
                    debug!(session = %self.session_name, tool = %tool_name, "auto-approving permission");
                    let engine = Arc::clone(self);
                    let tool = tool_name.clone();
                    self.spawn_guarded(async move {
                        tokio::time::sleep(HOOK_APPROVE_DELAY).await;
                        engine.approve(&tool, "auto-approved").await;
                    });
                }
            }
            AgentSignal::YoloApprovalOccurred { tool_name, .. } => {
                // The sidecar already answered; just account for it.
                self.approvals
                    .log(tool_name, "auto-approved (sentinel)", 1);
            }
            AgentSignal::StateChanged(AgentState::Idle) => self.on_idle(),
            _ => {}
        }
    }

    fn on_idle(self: &Arc<Self>) {
        if self.blocked() {
            return;
        }
        let double = self.double_yolo();
        let triple = self.triple_yolo();

        if triple && double && self.try_suggestions_first() {
            // Suggestion path first; if the agent is still idle afterwards,
            // fall back to auto-continue.
            let engine = Arc::clone(self);
            self.spawn_guarded(async move {
                tokio::time::sleep(SUGGESTION_DELAY).await;
                if engine.machine.state() == AgentState::Idle && !engine.blocked() {
                    engine.accept_suggestion().await;
                }
                tokio::time::sleep(SUGGESTION_FALLBACK_DELAY).await;
                if engine.machine.state() == AgentState::Idle
                    && engine.triple_yolo()
                    && !engine.blocked()
                {
                    engine.auto_continue().await;
                }
            });
        } else if triple {
            let engine = Arc::clone(self);
            self.spawn_guarded(async move {
                tokio::time::sleep(CONTINUE_DELAY).await;
                if !engine.blocked() {
                    engine.auto_continue().await;
                }
            });
        } else if double {
            let engine = Arc::clone(self);
            self.spawn_guarded(async move {
                tokio::time::sleep(SUGGESTION_DELAY).await;
                if !engine.blocked() {
                    engine.accept_suggestion().await;
                }
            });
        }
    }

    // --- Actions ---

    /// Send Enter; the agent's permission UI has "Yes" pre-selected.
    async fn approve(&self, tool_name: &str, action: &str) {
        if let Err(err) = self.tmux.send_keys(&self.session_name, "\n").await {
            warn!(session = %self.session_name, error = %err, "approve keystroke failed");
            return;
        }
        self.approvals.log(tool_name, action, 1);
    }

    /// Tab then Enter. With no visible suggestion Tab is a no-op and Enter on
    /// an empty prompt is ignored, so firing speculatively is safe.
    async fn accept_suggestion(&self) {
        if !self.double_yolo() {
            return;
        }
        if let Err(err) = self.tmux.send_key_sequence(&self.session_name, "Tab").await {
            warn!(session = %self.session_name, error = %err, "suggestion Tab failed");
            return;
        }
        tokio::time::sleep(TAB_ENTER_GAP).await;
        if let Err(err) = self.tmux.send_keys(&self.session_name, "\n").await {
            warn!(session = %self.session_name, error = %err, "suggestion Enter failed");
            return;
        }
        self.approvals.log("unknown", "auto-accepted", 2);
    }

    /// Submit the auto-continue prompt as a line.
    async fn auto_continue(&self) {
        if !self.triple_yolo() {
            return;
        }
        let prompt = self.auto_continue_prompt();
        if let Err(err) = self.tmux.send_keys(&self.session_name, &prompt).await {
            warn!(session = %self.session_name, error = %err, "auto-continue text failed");
            return;
        }
        if let Err(err) = self.tmux.send_key_sequence(&self.session_name, "Enter").await {
            warn!(session = %self.session_name, error = %err, "auto-continue Enter failed");
            return;
        }
        self.approvals.log("unknown", "auto-continued", 3);
    }

    // --- Sentinel file ---

    /// Write the sentinel that lets the sidecar pre-approve inline.
    pub fn write_sentinel(&self) {
        let path = yolo_sentinel_path(&self.socket_path);
        if let Err(err) = std::fs::write(&path, "1") {
            warn!(path = %path.display(), error = %err, "failed to write yolo sentinel");
        }
    }

    /// Remove the sentinel; single-writer, so a missing file is fine.
    pub fn remove_sentinel(&self) {
        let path = yolo_sentinel_path(&self.socket_path);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }

    // --- Permission prompt polling ---

    /// Start the pane-scrape fallback loop used when hooks are absent or late.
    pub fn start_permission_polling(self: &Arc<Self>) {
        let mut guard = self
            .poll_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((_, task)) = guard.as_ref() {
            if !task.is_finished() {
                return;
            }
        }

        let poll_cancel = self.cancel.child_token();
        let engine = Arc::clone(self);
        let cancel = poll_cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => engine.poll_for_permission_prompt().await,
                }
            }
        });
        *guard = Some((poll_cancel, task));
        debug!(session = %self.session_name, "permission polling started");
    }

    pub fn stop_permission_polling(&self) {
        if let Ok(mut guard) = self.poll_task.lock() {
            if let Some((cancel, task)) = guard.take() {
                cancel.cancel();
                task.abort();
            }
        }
        self.prompt_detected.store(false, Ordering::Relaxed);
    }

    async fn poll_for_permission_prompt(self: &Arc<Self>) {
        if !self.yolo() || self.blocked() {
            return;
        }

        // Only the last 5 lines; the permission UI sits at the very bottom
        // and older output can contain both tokens by coincidence.
        let output = match self.tmux.capture_pane(&self.session_name, -5, 0).await {
            Ok(output) => output,
            // Capture failures (including timeouts) read as "no signal".
            Err(_) => return,
        };

        if detect_permission_prompt(&output) {
            // Rising edge only.
            if !self.prompt_detected.swap(true, Ordering::Relaxed) {
                debug!(session = %self.session_name, "permission prompt detected in pane");
                let engine = Arc::clone(self);
                let detected = Arc::clone(&self.prompt_detected);
                self.spawn_guarded(async move {
                    tokio::time::sleep(POLL_APPROVE_DELAY).await;
                    engine.approve("unknown", "auto-approved").await;
                    tokio::time::sleep(POLL_COOLDOWN).await;
                    detected.store(false, Ordering::Relaxed);
                });
            }
        } else {
            self.prompt_detected.store(false, Ordering::Relaxed);
        }
    }

    // --- Idle polling (L3 fallback when hooks are absent or late) ---

    /// Start scraping the pane for the idle input prompt.
    pub fn start_idle_polling(self: &Arc<Self>) {
        let mut guard = self
            .idle_poll_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((_, task)) = guard.as_ref() {
            if !task.is_finished() {
                return;
            }
        }

        let poll_cancel = self.cancel.child_token();
        let engine = Arc::clone(self);
        let cancel = poll_cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => engine.poll_for_idle_prompt().await,
                }
            }
        });
        *guard = Some((poll_cancel, task));
        debug!(session = %self.session_name, "idle polling started");
    }

    pub fn stop_idle_polling(&self) {
        if let Ok(mut guard) = self.idle_poll_task.lock() {
            if let Some((cancel, task)) = guard.take() {
                cancel.cancel();
                task.abort();
            }
        }
        self.idle_detected.store(false, Ordering::Relaxed);
    }

    async fn poll_for_idle_prompt(self: &Arc<Self>) {
        if !self.triple_yolo() || self.blocked() {
            return;
        }
        // Hook-driven idle already handled this transition.
        if self.machine.state() == AgentState::Idle {
            return;
        }

        let output = match self.tmux.capture_pane(&self.session_name, -15, 0).await {
            Ok(output) => output,
            Err(_) => return,
        };

        if crate::agent::detect_idle_prompt(&output) {
            if !self.idle_detected.swap(true, Ordering::Relaxed) {
                debug!(session = %self.session_name, "idle prompt detected in pane");
                // Correct the machine; the Idle transition drives the normal
                // L2/L3 path.
                self.machine.set_state(AgentState::Idle);
                let detected = Arc::clone(&self.idle_detected);
                self.spawn_guarded(async move {
                    tokio::time::sleep(IDLE_POLL_COOLDOWN).await;
                    detected.store(false, Ordering::Relaxed);
                });
            }
        } else {
            self.idle_detected.store(false, Ordering::Relaxed);
        }
    }

    /// Tear down: stop polling and remove the sentinel.
    pub fn shutdown(&self) {
        self.stop_permission_polling();
        self.stop_idle_polling();
        self.remove_sentinel();
    }

    /// Spawn a deferred action bound to the engine's lifetime.
    fn spawn_guarded(&self, action: impl std::future::Future<Output = ()> + Send + 'static) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = action => {}
            }
        });
    }
}

impl Drop for AutonomyEngine {
    fn drop(&mut self) {
        for slot in [&self.poll_task, &self.idle_poll_task] {
            if let Ok(mut guard) = slot.lock() {
                if let Some((cancel, task)) = guard.take() {
                    cancel.cancel();
                    task.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine(dir: &tempfile::TempDir) -> Arc<AutonomyEngine> {
        Arc::new(AutonomyEngine::new(
            "konsolai-test-a1b2c3d4".to_string(),
            TmuxDriver::new(),
            dir.path().join("a1b2c3d4.sock"),
            Arc::new(AgentStateMachine::new()),
            Arc::new(BudgetController::new()),
            Arc::new(ApprovalLog::new()),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn preset_sets_flags_without_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        engine.preset(true, true, false);

        assert!(engine.yolo());
        assert!(engine.double_yolo());
        assert!(!engine.triple_yolo());
        assert!(!yolo_sentinel_path(&dir.path().join("a1b2c3d4.sock")).exists());
    }

    #[tokio::test]
    async fn set_yolo_manages_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let sentinel = yolo_sentinel_path(&dir.path().join("a1b2c3d4.sock"));

        engine.set_yolo(true);
        assert!(sentinel.exists());
        assert_eq!(std::fs::read_to_string(&sentinel).unwrap(), "1");

        engine.set_yolo(false);
        assert!(!sentinel.exists());
    }

    #[tokio::test]
    async fn sentinel_approval_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);

        engine.handle_signal(&AgentSignal::YoloApprovalOccurred {
            tool_name: "Bash".to_string(),
            tool_input: String::new(),
        });
        assert_eq!(engine.approvals.yolo_count(), 1);
        let entry = &engine.approvals.entries()[0];
        assert_eq!(entry.tool_name, "Bash");
        assert_eq!(entry.yolo_level, 1);
    }

    #[tokio::test]
    async fn intervention_block_gates_actions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        assert!(!engine.blocked());

        engine.set_intervention_block(true);
        assert!(engine.blocked());

        engine.set_intervention_block(false);
        assert!(!engine.blocked());
    }

    #[tokio::test]
    async fn auto_continue_prompt_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        assert_eq!(engine.auto_continue_prompt(), DEFAULT_AUTO_CONTINUE_PROMPT);

        engine.set_auto_continue_prompt("Keep fixing the parser");
        assert_eq!(engine.auto_continue_prompt(), "Keep fixing the parser");
    }

    #[tokio::test]
    async fn polling_start_is_idempotent_and_stoppable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);

        engine.start_permission_polling();
        engine.start_permission_polling();
        engine.stop_permission_polling();
        // Stopping twice is harmless.
        engine.stop_permission_polling();
    }
}
