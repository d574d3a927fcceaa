//! Claude session: composition of driver, hook server, state machine,
//! autonomy, budget, observer, and resource monitor.
//!
//! A session owns its tmux session name for life. Closing the hosting
//! terminal detaches; the tmux session (and the agent inside it) keeps
//! running and can be reattached later. Naming convention:
//! `konsolai-{profile}-{8-hex-id}`.

pub mod autonomy;
pub mod conversations;
pub mod metadata;
pub mod registry;
pub mod state;

pub use autonomy::AutonomyEngine;
pub use conversations::{read_claude_conversations, ClaudeConversation};
pub use metadata::{MetadataEvent, SessionMetadata, SessionMetadataStore};
pub use registry::{RegistryEvent, SessionRegistry};
pub use state::SessionState;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use regex::Regex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use konsolai_hooks::config::{generate_hooks_config, remove_hooks_config, write_hooks_config};
use konsolai_hooks::server::HookServer;
use konsolai_hooks::HookServerEvent;

use crate::agent::model::{build_agent_command, is_agent_available};
use crate::agent::{
    AgentModel, AgentSignal, AgentState, AgentStateMachine, ApprovalLog, ApprovalLogEntry,
    TokenUsage,
};
use crate::budget::{BudgetController, BudgetEvent};
use crate::error::{KonsolaiError, Result};
use crate::observer::{Intervention, ObserverConfig, ObserverEvent, SessionObserver};
use crate::resource::ResourceMonitor;
use crate::settings::KonsolaiSettings;
use crate::tmux::{TmuxDriver, TmuxError};
use crate::util::find_executable;

/// Session-level event stream aggregating the inner components.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(AgentState),
    TaskStarted(String),
    TaskFinished,
    PermissionRequested { tool_name: String },
    ApprovalLogged(ApprovalLogEntry),
    TokenUsageChanged(TokenUsage),
    Budget(BudgetEvent),
    Stuck(ObserverEvent),
    TaskCompleted { subject: String },
    Detached,
    Killed,
}

static REATTACH_NAME_PATTERN: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^konsolai-(.+)-([a-f0-9]{8})$").expect("session name pattern")
});

/// A Claude-enabled terminal session backed by tmux.
pub struct ClaudeSession {
    session_name: String,
    session_id: String,
    profile_name: String,
    working_dir: RwLock<String>,
    model: RwLock<AgentModel>,
    resume_session_id: RwLock<Option<String>>,
    is_reattach: bool,

    tmux: TmuxDriver,
    hooks: HookServer,
    machine: Arc<AgentStateMachine>,
    autonomy: Arc<AutonomyEngine>,
    budget: Arc<BudgetController>,
    observer: Arc<SessionObserver>,
    resources: Arc<ResourceMonitor>,
    approvals: Arc<ApprovalLog>,
    token_usage: RwLock<TokenUsage>,

    event_tx: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    running: AtomicBool,
    pumps_started: AtomicBool,
}

impl ClaudeSession {
    /// Create a new session for `profile_name` rooted at `working_dir`.
    pub fn new(
        profile_name: &str,
        working_dir: &str,
        settings: &KonsolaiSettings,
    ) -> Result<Arc<Self>> {
        let session_id = TmuxDriver::generate_session_id();
        let session_name = TmuxDriver::build_session_name(
            profile_name,
            &session_id,
            Some(&settings.session_name_template),
        );
        let working_dir = if working_dir.is_empty() {
            dirs::home_dir()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|| "/".to_string())
        } else {
            working_dir.to_string()
        };

        let hooks = HookServer::new(&session_id)?;
        Ok(Self::assemble(
            session_name,
            session_id,
            profile_name.to_string(),
            working_dir,
            false,
            hooks,
            settings,
        ))
    }

    /// Create a session that reattaches to an existing tmux session.
    ///
    /// The working directory is left empty here; `run()` recovers it from the
    /// live tmux pane.
    pub fn for_reattach(
        existing_session_name: &str,
        settings: &KonsolaiSettings,
    ) -> Result<Arc<Self>> {
        let (profile_name, session_id) =
            match REATTACH_NAME_PATTERN.captures(existing_session_name) {
                Some(captures) => (captures[1].to_string(), captures[2].to_string()),
                None => ("unknown".to_string(), String::new()),
            };

        // Sessions with non-standard names still get a hook socket, keyed by
        // the full name.
        let hook_id = if session_id.is_empty() {
            existing_session_name.to_string()
        } else {
            session_id.clone()
        };
        let hooks = HookServer::new(&hook_id)?;

        Ok(Self::assemble(
            existing_session_name.to_string(),
            session_id,
            profile_name,
            String::new(),
            true,
            hooks,
            settings,
        ))
    }

    fn assemble(
        session_name: String,
        session_id: String,
        profile_name: String,
        working_dir: String,
        is_reattach: bool,
        hooks: HookServer,
        settings: &KonsolaiSettings,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let tmux = TmuxDriver::new();
        let machine = Arc::new(AgentStateMachine::new());
        let budget = Arc::new(BudgetController::new());
        let approvals = Arc::new(ApprovalLog::new());
        let observer = Arc::new(SessionObserver::new(ObserverConfig {
            policy: settings.observer_policy,
            ..ObserverConfig::default()
        }));
        let resources = Arc::new(ResourceMonitor::new());

        let autonomy = Arc::new(AutonomyEngine::new(
            session_name.clone(),
            tmux.clone(),
            hooks.socket_path().to_path_buf(),
            Arc::clone(&machine),
            Arc::clone(&budget),
            Arc::clone(&approvals),
            cancel.child_token(),
        ));
        autonomy.preset(
            settings.yolo_mode,
            settings.double_yolo_mode,
            settings.triple_yolo_mode,
        );
        autonomy.set_try_suggestions_first(settings.try_suggestions_first);
        autonomy.set_auto_continue_prompt(&settings.auto_continue_prompt);

        let (event_tx, _) = broadcast::channel(512);
        Arc::new(Self {
            session_name,
            session_id,
            profile_name,
            working_dir: RwLock::new(working_dir),
            model: RwLock::new(AgentModel::Default),
            resume_session_id: RwLock::new(None),
            is_reattach,
            tmux,
            hooks,
            machine,
            autonomy,
            budget,
            observer,
            resources,
            approvals,
            token_usage: RwLock::new(TokenUsage::default()),
            event_tx,
            cancel,
            running: AtomicBool::new(false),
            pumps_started: AtomicBool::new(false),
        })
    }

    // --- Accessors ---

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    pub fn working_directory(&self) -> String {
        self.working_dir
            .read()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn is_reattach(&self) -> bool {
        self.is_reattach
    }

    pub fn model(&self) -> AgentModel {
        self.model.read().map(|m| *m).unwrap_or_default()
    }

    pub fn set_model(&self, model: AgentModel) {
        if let Ok(mut guard) = self.model.write() {
            *guard = model;
        }
    }

    pub fn resume_session_id(&self) -> Option<String> {
        self.resume_session_id
            .read()
            .map(|id| id.clone())
            .unwrap_or(None)
    }

    /// Resume a previous Claude CLI conversation when starting this session.
    pub fn set_resume_session_id(&self, id: Option<String>) {
        if let Ok(mut guard) = self.resume_session_id.write() {
            *guard = id;
        }
    }

    pub fn state(&self) -> AgentState {
        self.machine.state()
    }

    pub fn current_task(&self) -> String {
        self.machine.current_task()
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.token_usage
            .read()
            .map(|u| *u)
            .unwrap_or_default()
    }

    pub fn autonomy(&self) -> &Arc<AutonomyEngine> {
        &self.autonomy
    }

    pub fn budget_controller(&self) -> &Arc<BudgetController> {
        &self.budget
    }

    pub fn observer(&self) -> &Arc<SessionObserver> {
        &self.observer
    }

    pub fn approvals(&self) -> &Arc<ApprovalLog> {
        &self.approvals
    }

    pub fn state_machine(&self) -> &Arc<AgentStateMachine> {
        &self.machine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    // --- Lifecycle ---

    /// Prepare the session and return the shell command the hosting terminal
    /// should run (the tmux attach/create invocation).
    ///
    /// Fails when tmux or the agent CLI is missing. A hook-server failure is
    /// degraded mode, not fatal: the session runs without hook events.
    pub async fn run(self: &Arc<Self>) -> Result<String> {
        if !TmuxDriver::is_available() {
            return Err(KonsolaiError::Tmux(TmuxError::NotFound));
        }
        if !is_agent_available() {
            return Err(KonsolaiError::AgentCliUnavailable);
        }

        // Reattach: recover the real working directory from the live pane;
        // it is where the agent is actually running, not where we started.
        if self.is_reattach && self.tmux.exists(&self.session_name).await {
            if let Ok(pane_dir) = self.tmux.pane_working_directory(&self.session_name).await {
                if !pane_dir.is_empty() && std::path::Path::new(&pane_dir).is_dir() {
                    debug!(session = %self.session_name, dir = %pane_dir, "recovered working dir from tmux");
                    if let Ok(mut dir) = self.working_dir.write() {
                        *dir = pane_dir;
                    }
                }
            }
        }

        // A vanished working directory falls back to the current one.
        {
            let current = self.working_directory();
            if !current.is_empty() && !std::path::Path::new(&current).is_dir() {
                let fallback = std::env::current_dir()
                    .map(|d| d.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "/".to_string());
                warn!(session = %self.session_name, missing = %current, fallback = %fallback,
                    "working directory does not exist");
                if let Ok(mut dir) = self.working_dir.write() {
                    *dir = fallback;
                }
            }
        }

        match self.hooks.start() {
            Ok(()) => {
                info!(session = %self.session_name, socket = %self.hooks.socket_path().display(),
                    "hook server listening");
                self.write_hook_config();
            }
            Err(err) => {
                // Degraded mode: no hook events, pane polling still works.
                warn!(session = %self.session_name, error = %err, "hook server failed to start");
                self.machine.set_state(AgentState::Error);
            }
        }

        if self.autonomy.yolo() {
            self.autonomy.write_sentinel();
            self.autonomy.start_permission_polling();
        }
        if self.autonomy.triple_yolo() {
            self.autonomy.start_idle_polling();
        }

        self.wire_events();
        self.budget.spawn_time_loop(self.cancel.child_token());
        self.observer.spawn_sweep_loop(self.cancel.child_token());
        self.resources.spawn_loop(self.cancel.child_token());

        self.running.store(true, Ordering::Relaxed);
        if self.machine.state() != AgentState::Error {
            self.machine.set_state(AgentState::Starting);
        }

        Ok(self.shell_command())
    }

    /// The tmux command that starts or attaches this session.
    pub fn shell_command(&self) -> String {
        if self.is_reattach {
            return TmuxDriver::build_attach_command(&self.session_name);
        }

        let mut extra_args = Vec::new();
        if let Some(resume_id) = self.resume_session_id() {
            extra_args.push("--resume".to_string());
            extra_args.push(resume_id);
        }
        let agent_cmd = build_agent_command(self.model(), &extra_args);
        TmuxDriver::build_new_session_command(
            &self.session_name,
            &agent_cmd,
            true,
            &self.working_directory(),
        )
    }

    fn write_hook_config(&self) {
        let hook_binary =
            find_executable("konsolai-hook").unwrap_or_else(|| "konsolai-hook".into());
        let fragment = generate_hooks_config(&hook_binary, self.hooks.socket_path());
        let working_dir = std::path::PathBuf::from(self.working_directory());
        match write_hooks_config(&working_dir, &fragment) {
            Ok(path) => debug!(session = %self.session_name, path = %path.display(), "wrote hooks config"),
            Err(err) => warn!(session = %self.session_name, error = %err, "failed to write hooks config"),
        }
    }

    /// Wire the inner components together. Idempotent; `run()` calls this,
    /// and embedders driving a session without tmux may call it directly.
    pub fn wire_events(self: &Arc<Self>) {
        if self.pumps_started.swap(true, Ordering::Relaxed) {
            return;
        }
        self.spawn_pumps();
    }

    fn spawn_pumps(self: &Arc<Self>) {
        // Hook frames -> state machine.
        {
            let session = Arc::clone(self);
            let mut rx = self.hooks.subscribe();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Ok(HookServerEvent::EventReceived { event_type, data }) => {
                                session.machine.handle_hook_event(&event_type, &data);
                            }
                            Ok(HookServerEvent::Error(message)) => {
                                warn!(session = %session.session_name, %message, "hook frame error");
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(session = %session.session_name, skipped, "hook event pump lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        // Agent signals -> autonomy + observer + session events.
        {
            let session = Arc::clone(self);
            let mut rx = self.machine.subscribe();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        signal = rx.recv() => match signal {
                            Ok(signal) => session.dispatch_agent_signal(&signal),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        // Approvals -> observer + session events.
        {
            let session = Arc::clone(self);
            let mut rx = self.approvals.subscribe();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        entry = rx.recv() => match entry {
                            Ok(entry) => {
                                session
                                    .observer
                                    .on_approval_logged(&entry.tool_name, entry.timestamp);
                                let _ = session
                                    .event_tx
                                    .send(SessionEvent::ApprovalLogged(entry));
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        // Budget events -> session events.
        {
            let session = Arc::clone(self);
            let mut rx = self.budget.subscribe();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Ok(event) => {
                                let _ = session.event_tx.send(SessionEvent::Budget(event));
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        // Observer events -> autonomy gating + session events.
        {
            let session = Arc::clone(self);
            let mut rx = self.observer.subscribe();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Ok(event) => {
                                session.apply_observer_event(&event);
                                let _ = session.event_tx.send(SessionEvent::Stuck(event));
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        // Resource samples -> budget gate.
        {
            let session = Arc::clone(self);
            let mut rx = self.resources.subscribe();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        usage = rx.recv() => match usage {
                            Ok(usage) => session.budget.on_resource_usage(&usage),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }
    }

    fn dispatch_agent_signal(self: &Arc<Self>, signal: &AgentSignal) {
        self.autonomy.handle_signal(signal);

        match signal {
            AgentSignal::StateChanged(state) => {
                self.observer.on_state_changed(*state);
                let _ = self.event_tx.send(SessionEvent::StateChanged(*state));
            }
            AgentSignal::TaskStarted(task) => {
                let _ = self.event_tx.send(SessionEvent::TaskStarted(task.clone()));
            }
            AgentSignal::TaskFinished => {
                let _ = self.event_tx.send(SessionEvent::TaskFinished);
            }
            AgentSignal::PermissionRequested { tool_name, .. } => {
                let _ = self.event_tx.send(SessionEvent::PermissionRequested {
                    tool_name: tool_name.clone(),
                });
            }
            AgentSignal::SubagentStarted { agent_id, .. } => {
                self.observer.on_subagent_started(agent_id);
            }
            AgentSignal::SubagentStopped { agent_id, .. } => {
                self.observer.on_subagent_stopped(agent_id);
            }
            AgentSignal::TaskCompleted { task_subject, .. } => {
                let _ = self.event_tx.send(SessionEvent::TaskCompleted {
                    subject: task_subject.clone(),
                });
            }
            _ => {}
        }
    }

    fn apply_observer_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::InterventionSuggested { intervention, .. } => {
                if matches!(
                    intervention,
                    Intervention::Pause | Intervention::Adjust | Intervention::Redirect
                ) {
                    self.autonomy.set_intervention_block(true);
                }
            }
            ObserverEvent::StuckCleared { .. } => {
                if self.observer.composed_severity() == 0 {
                    self.autonomy.set_intervention_block(false);
                }
            }
            ObserverEvent::StuckDetected { .. } => {}
        }
    }

    // --- Operations ---

    /// Record fresh token usage and fan it out to budget and observer.
    pub fn update_token_usage(&self, usage: TokenUsage) {
        if let Ok(mut guard) = self.token_usage.write() {
            *guard = usage;
        }
        self.budget.on_token_usage(&usage);
        self.observer.on_token_usage(
            usage.input_tokens,
            usage.output_tokens,
            usage.total_tokens(),
            usage.estimated_cost_usd(),
        );
        let _ = self.event_tx.send(SessionEvent::TokenUsageChanged(usage));
    }

    /// Submit a prompt to the agent.
    pub async fn send_prompt(&self, prompt: &str) -> Result<()> {
        self.tmux.send_keys(&self.session_name, prompt).await?;
        self.tmux
            .send_key_sequence(&self.session_name, "Enter")
            .await?;
        Ok(())
    }

    /// Send raw text to the session.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.tmux.send_keys(&self.session_name, text).await?;
        Ok(())
    }

    /// Approve a pending permission request (the default option is
    /// pre-selected, so Enter suffices).
    pub async fn approve_permission(&self) -> Result<()> {
        self.send_text("\n").await
    }

    /// Approve and pick "Always allow" (option 2) to reduce future prompts.
    pub async fn approve_permission_always(&self) -> Result<()> {
        self.tmux.send_key_sequence(&self.session_name, "Down").await?;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.tmux
            .send_key_sequence(&self.session_name, "Enter")
            .await?;
        Ok(())
    }

    /// Deny a pending permission request.
    pub async fn deny_permission(&self) -> Result<()> {
        self.send_text("n\n").await
    }

    /// Interrupt the agent (Ctrl+C). A named key sequence, not literal text.
    pub async fn interrupt(&self) -> Result<()> {
        self.tmux.send_key_sequence(&self.session_name, "C-c").await?;
        Ok(())
    }

    /// Interrupt and relaunch the agent CLI in place.
    pub async fn restart_agent(&self) -> Result<()> {
        self.interrupt().await?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let agent_cmd = build_agent_command(self.model(), &[]);
        self.send_text(&format!("{agent_cmd}\n")).await
    }

    /// Detach the hosting terminal; the tmux session keeps running.
    pub async fn detach(&self) {
        if let Err(err) = self.tmux.detach(&self.session_name).await {
            warn!(session = %self.session_name, error = %err, "detach failed");
        }
        let _ = self.event_tx.send(SessionEvent::Detached);
    }

    /// Kill the tmux session.
    pub async fn kill(&self) {
        if let Err(err) = self.tmux.kill(&self.session_name).await {
            warn!(session = %self.session_name, error = %err, "kill failed");
        }
        let _ = self.event_tx.send(SessionEvent::Killed);
    }

    /// Captured pane scrollback, most recent `lines` lines. Empty on failure;
    /// transcripts are a non-critical path.
    pub async fn transcript(&self, lines: u32) -> String {
        self.tmux
            .capture_pane(&self.session_name, -(lines as i32), 0)
            .await
            .unwrap_or_default()
    }

    /// Tear everything down in reverse creation order: timers and pumps,
    /// autonomy artifacts, hook server (socket file removed), hooks config.
    pub async fn shutdown(&self) {
        let was_running = self.running.swap(false, Ordering::Relaxed);

        self.cancel.cancel();
        self.autonomy.shutdown();
        self.hooks.stop().await;

        if was_running {
            let working_dir = std::path::PathBuf::from(self.working_directory());
            if let Err(err) = remove_hooks_config(&working_dir) {
                warn!(session = %self.session_name, error = %err, "failed to remove hooks config");
            }
            info!(session = %self.session_name, "session shut down");
        }

        self.machine.set_state(AgentState::NotRunning);
    }
}
