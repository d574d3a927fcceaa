//! Session-level stuck-pattern observer (L4).
//!
//! Pure heuristic supervision, zero tokens spent. Watches the session's
//! existing signals (state transitions, token updates, approvals, subagent
//! lifecycles) and suggests interventions; it never sends keystrokes itself.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::AgentState;

/// Stuck pattern types detected by the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StuckPattern {
    /// Working→Idle cycles with little progress
    IdleLoop,
    /// Error-like transitions repeating in a short window
    ErrorLoop,
    /// High token/cost burn with nothing to show for it
    CostSpiral,
    /// Input tokens very high, output share shrinking
    ContextRot,
    /// Too many permission approvals in a short window
    PermissionStorm,
    /// Subagents starting and stopping without completing
    SubagentChurn,
}

/// Intervention types, escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intervention {
    Notify,
    Pause,
    Adjust,
    Redirect,
    Restart,
}

/// How aggressively the observer may act on what it sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObserverPolicy {
    NotifyOnly,
    AutoDowngrade,
    #[default]
    AutoRedirect,
    FullAuto,
}

/// Per-pattern enables and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObserverConfig {
    pub idle_loop_enabled: bool,
    pub error_loop_enabled: bool,
    pub cost_spiral_enabled: bool,
    pub context_rot_enabled: bool,
    pub permission_storm_enabled: bool,
    pub subagent_churn_enabled: bool,

    pub policy: ObserverPolicy,

    pub idle_loop_cycle_threshold: usize,
    pub idle_loop_min_work_seconds: i64,
    pub idle_loop_min_tokens: u64,

    pub error_loop_count: usize,
    pub error_loop_window_seconds: i64,

    pub cost_spiral_token_threshold: u64,
    pub cost_spiral_cost_threshold: f64,
    pub cost_spiral_window_seconds: i64,

    pub context_rot_input_threshold: u64,
    pub context_rot_output_ratio: f64,

    pub perm_storm_count: usize,
    pub perm_storm_window_seconds: i64,
    pub perm_storm_same_tool_percent: f64,

    pub subagent_churn_count: usize,
    pub subagent_churn_window_seconds: i64,
    pub subagent_churn_completion_percent: f64,

    /// Cooldown between interventions for the same pattern.
    pub intervention_cooldown_secs: i64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            idle_loop_enabled: true,
            error_loop_enabled: true,
            cost_spiral_enabled: true,
            context_rot_enabled: true,
            permission_storm_enabled: true,
            subagent_churn_enabled: true,
            policy: ObserverPolicy::AutoRedirect,
            idle_loop_cycle_threshold: 3,
            idle_loop_min_work_seconds: 15,
            idle_loop_min_tokens: 5000,
            error_loop_count: 3,
            error_loop_window_seconds: 300,
            cost_spiral_token_threshold: 100_000,
            cost_spiral_cost_threshold: 1.0,
            cost_spiral_window_seconds: 300,
            context_rot_input_threshold: 800_000,
            context_rot_output_ratio: 0.5,
            perm_storm_count: 10,
            perm_storm_window_seconds: 30,
            perm_storm_same_tool_percent: 60.0,
            subagent_churn_count: 5,
            subagent_churn_window_seconds: 600,
            subagent_churn_completion_percent: 20.0,
            intervention_cooldown_secs: 120,
        }
    }
}

/// A detected stuck event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckEvent {
    pub pattern: StuckPattern,
    /// 1-3
    pub severity: u8,
    pub description: String,
    pub suggested_intervention: Intervention,
    pub detected_at: DateTime<Utc>,
}

/// Events broadcast by the observer.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    StuckDetected {
        pattern: StuckPattern,
        severity: u8,
        description: String,
    },
    StuckCleared {
        pattern: StuckPattern,
    },
    InterventionSuggested {
        intervention: Intervention,
        description: String,
    },
}

/// Minimum runtime for a subagent stop to count as a completion.
const SUBAGENT_COMPLETION_MIN_SECS: i64 = 30;

/// Samples averaged to establish the baseline output/input ratio.
const OUTPUT_RATIO_SAMPLE_COUNT: u32 = 3;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct WorkCycle {
    end_time: DateTime<Utc>,
    duration_secs: i64,
    token_delta: u64,
}

#[derive(Default)]
struct ObserverState {
    active_events: Vec<StuckEvent>,
    last_intervention_time: HashMap<StuckPattern, DateTime<Utc>>,

    last_state: AgentState,

    current_total_tokens: u64,
    current_input_tokens: u64,
    current_output_tokens: u64,
    current_cost_usd: f64,

    working_start_time: Option<DateTime<Utc>>,
    tokens_at_working_start: u64,
    work_cycles: Vec<WorkCycle>,

    error_signatures: Vec<(DateTime<Utc>, String)>,

    cost_window_start: Option<DateTime<Utc>>,
    cost_window_start_tokens: u64,
    cost_window_start_cost: f64,

    initial_output_ratio: f64,
    output_ratio_samples: u32,

    recent_approvals: Vec<(DateTime<Utc>, String)>,

    active_subagents: HashSet<String>,
    subagent_start_times: HashMap<String, DateTime<Utc>>,
    subagent_lifecycles: Vec<(DateTime<Utc>, bool)>,
}

/// Monitors one session for stuck patterns and suggests interventions.
pub struct SessionObserver {
    config: Mutex<ObserverConfig>,
    state: Mutex<ObserverState>,
    event_tx: broadcast::Sender<ObserverEvent>,
}

impl Default for SessionObserver {
    fn default() -> Self {
        Self::new(ObserverConfig::default())
    }
}

impl SessionObserver {
    pub fn new(config: ObserverConfig) -> Self {
        let (event_tx, _) = broadcast::channel(128);
        Self {
            config: Mutex::new(config),
            state: Mutex::new(ObserverState::default()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.event_tx.subscribe()
    }

    pub fn set_config(&self, config: ObserverConfig) {
        if let Ok(mut guard) = self.config.lock() {
            *guard = config;
        }
    }

    pub fn config(&self) -> ObserverConfig {
        self.config
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Sum of severities of currently active events.
    pub fn composed_severity(&self) -> u32 {
        self.state
            .lock()
            .map(|s| s.active_events.iter().map(|e| e.severity as u32).sum())
            .unwrap_or(0)
    }

    pub fn active_events(&self) -> Vec<StuckEvent> {
        self.state
            .lock()
            .map(|s| s.active_events.clone())
            .unwrap_or_default()
    }

    /// Clear tracking state. Cooldown timestamps survive a reset.
    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            let cooldowns = std::mem::take(&mut state.last_intervention_time);
            *state = ObserverState {
                last_intervention_time: cooldowns,
                ..ObserverState::default()
            };
        }
    }

    /// Default corrective prompt for a pattern.
    pub fn corrective_prompt(pattern: StuckPattern) -> &'static str {
        match pattern {
            StuckPattern::IdleLoop => {
                "Summarize progress, identify blockers, try a different approach"
            }
            StuckPattern::ErrorLoop => {
                "Same error N times. Read it carefully, search for root cause, check prerequisites"
            }
            StuckPattern::CostSpiral => {
                "Consumed too many tokens with no code changes. Commit progress, plan next actions"
            }
            StuckPattern::ContextRot => {
                "Responses degrading. Summarize learnings, create concise action plan"
            }
            StuckPattern::PermissionStorm => {
                "Too many permission requests. Consider restructuring approach"
            }
            StuckPattern::SubagentChurn => {
                "Many agents starting and stopping without completing. Focus on a single approach"
            }
        }
    }

    // --- Event handlers ---

    pub fn on_state_changed(&self, new_state: AgentState) {
        let now = Utc::now();
        let config = self.config();
        let mut state = self.lock_state();

        // Working -> Idle: record a work cycle and an error signature.
        if state.last_state == AgentState::Working && new_state == AgentState::Idle {
            let (duration_secs, token_delta) = match state.working_start_time {
                Some(start) => (
                    (now - start).num_seconds(),
                    state.current_total_tokens - state.tokens_at_working_start,
                ),
                None => (0, 0),
            };
            state.work_cycles.push(WorkCycle {
                end_time: now,
                duration_secs,
                token_delta,
            });
            state.error_signatures.push((now, "Working->Idle".to_string()));

            self.check_idle_loop(&config, &mut state);
            self.check_error_loop(&config, &mut state);
        }

        if new_state == AgentState::Error {
            state.error_signatures.push((Utc::now(), "Error".to_string()));
            self.check_error_loop(&config, &mut state);
        }

        if new_state == AgentState::Working {
            state.working_start_time = Some(now);
            state.tokens_at_working_start = state.current_total_tokens;
        }

        state.last_state = new_state;
    }

    pub fn on_token_usage(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        cost_usd: f64,
    ) {
        let config = self.config();
        let mut state = self.lock_state();

        state.current_input_tokens = input_tokens;
        state.current_output_tokens = output_tokens;
        state.current_total_tokens = total_tokens;
        state.current_cost_usd = cost_usd;

        // Establish the baseline ratio as a running average of the first few
        // updates that carry input tokens.
        if state.output_ratio_samples < OUTPUT_RATIO_SAMPLE_COUNT && input_tokens > 0 {
            let ratio = output_tokens as f64 / input_tokens as f64;
            let n = state.output_ratio_samples as f64;
            state.initial_output_ratio = (state.initial_output_ratio * n + ratio) / (n + 1.0);
            state.output_ratio_samples += 1;
        }

        self.check_cost_spiral(&config, &mut state);
        self.check_context_rot(&config, &mut state);
    }

    pub fn on_approval_logged(&self, tool_name: &str, timestamp: DateTime<Utc>) {
        let config = self.config();
        let mut state = self.lock_state();
        state.recent_approvals.push((timestamp, tool_name.to_string()));
        self.check_permission_storm(&config, &mut state);
    }

    pub fn on_subagent_started(&self, agent_id: &str) {
        let mut state = self.lock_state();
        state.active_subagents.insert(agent_id.to_string());
        state
            .subagent_start_times
            .insert(agent_id.to_string(), Utc::now());
    }

    pub fn on_subagent_stopped(&self, agent_id: &str) {
        let now = Utc::now();
        let config = self.config();
        let mut state = self.lock_state();

        let completed = state
            .subagent_start_times
            .remove(agent_id)
            .map(|started| (now - started).num_seconds() >= SUBAGENT_COMPLETION_MIN_SECS)
            .unwrap_or(false);

        state.active_subagents.remove(agent_id);
        state.subagent_lifecycles.push((now, completed));

        self.check_subagent_churn(&config, &mut state);
    }

    /// Sweep old entries and re-run every check; runs on the 60-second loop.
    pub fn periodic_check(&self) {
        let config = self.config();
        let mut state = self.lock_state();
        self.cleanup_old_entries(&config, &mut state);
        self.check_idle_loop(&config, &mut state);
        self.check_error_loop(&config, &mut state);
        self.check_cost_spiral(&config, &mut state);
        self.check_context_rot(&config, &mut state);
        self.check_permission_storm(&config, &mut state);
        self.check_subagent_churn(&config, &mut state);
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn_sweep_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let observer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => observer.periodic_check(),
                }
            }
        })
    }

    // --- Pattern checks ---

    fn check_idle_loop(&self, config: &ObserverConfig, state: &mut ObserverState) {
        if !config.idle_loop_enabled {
            return;
        }
        let threshold = config.idle_loop_cycle_threshold;
        if state.work_cycles.len() < threshold {
            return;
        }

        let all_unproductive = state.work_cycles[state.work_cycles.len() - threshold..]
            .iter()
            .all(|cycle| {
                cycle.duration_secs < config.idle_loop_min_work_seconds
                    && cycle.token_delta < config.idle_loop_min_tokens
            });

        if all_unproductive {
            self.activate_pattern(
                config,
                state,
                StuckPattern::IdleLoop,
                1,
                format!("Agent completed {threshold} consecutive idle cycles with minimal work"),
            );
        } else {
            self.clear_pattern(state, StuckPattern::IdleLoop);
        }
    }

    fn check_error_loop(&self, config: &ObserverConfig, state: &mut ObserverState) {
        if !config.error_loop_enabled {
            return;
        }
        let window_start = Utc::now() - TimeDelta::seconds(config.error_loop_window_seconds);
        let count = state
            .error_signatures
            .iter()
            .filter(|(ts, _)| *ts >= window_start)
            .count();

        if count >= config.error_loop_count {
            self.activate_pattern(
                config,
                state,
                StuckPattern::ErrorLoop,
                2,
                format!(
                    "Detected {count} error-like transitions in {} seconds",
                    config.error_loop_window_seconds
                ),
            );
        } else {
            self.clear_pattern(state, StuckPattern::ErrorLoop);
        }
    }

    fn check_cost_spiral(&self, config: &ObserverConfig, state: &mut ObserverState) {
        if !config.cost_spiral_enabled {
            return;
        }
        let now = Utc::now();

        // Initialize or reset the window when it has expired.
        let expired = state
            .cost_window_start
            .map(|start| (now - start).num_seconds() > config.cost_spiral_window_seconds)
            .unwrap_or(true);
        if expired {
            state.cost_window_start = Some(now);
            state.cost_window_start_tokens = state.current_total_tokens;
            state.cost_window_start_cost = state.current_cost_usd;
            self.clear_pattern(state, StuckPattern::CostSpiral);
            return;
        }

        let token_delta = state.current_total_tokens - state.cost_window_start_tokens;
        let cost_delta = state.current_cost_usd - state.cost_window_start_cost;

        if token_delta >= config.cost_spiral_token_threshold
            && cost_delta >= config.cost_spiral_cost_threshold
        {
            let elapsed = state
                .cost_window_start
                .map(|start| (now - start).num_seconds())
                .unwrap_or(0);
            self.activate_pattern(
                config,
                state,
                StuckPattern::CostSpiral,
                2,
                format!("Consumed {token_delta} tokens (${cost_delta:.2}) in {elapsed} seconds"),
            );
        } else {
            self.clear_pattern(state, StuckPattern::CostSpiral);
        }
    }

    fn check_context_rot(&self, config: &ObserverConfig, state: &mut ObserverState) {
        if !config.context_rot_enabled {
            return;
        }
        if state.current_input_tokens < config.context_rot_input_threshold {
            return;
        }
        if state.initial_output_ratio <= 0.0
            || state.output_ratio_samples < OUTPUT_RATIO_SAMPLE_COUNT
        {
            return;
        }

        let current_ratio = if state.current_input_tokens > 0 {
            state.current_output_tokens as f64 / state.current_input_tokens as f64
        } else {
            0.0
        };
        let floor = state.initial_output_ratio * config.context_rot_output_ratio;

        if current_ratio < floor {
            self.activate_pattern(
                config,
                state,
                StuckPattern::ContextRot,
                2,
                format!(
                    "Output ratio degraded to {current_ratio:.3} (initial: {:.3}, threshold: {floor:.3})",
                    state.initial_output_ratio
                ),
            );
        } else {
            self.clear_pattern(state, StuckPattern::ContextRot);
        }
    }

    fn check_permission_storm(&self, config: &ObserverConfig, state: &mut ObserverState) {
        if !config.permission_storm_enabled {
            return;
        }
        let window_start = Utc::now() - TimeDelta::seconds(config.perm_storm_window_seconds);

        let mut tool_counts: HashMap<&str, usize> = HashMap::new();
        let mut total_in_window = 0usize;
        for (ts, tool) in &state.recent_approvals {
            if *ts >= window_start {
                total_in_window += 1;
                *tool_counts.entry(tool.as_str()).or_insert(0) += 1;
            }
        }

        if total_in_window >= config.perm_storm_count {
            let max_tool_count = tool_counts.values().copied().max().unwrap_or(0);
            let same_tool_percent = max_tool_count as f64 / total_in_window as f64 * 100.0;

            if same_tool_percent >= config.perm_storm_same_tool_percent {
                self.activate_pattern(
                    config,
                    state,
                    StuckPattern::PermissionStorm,
                    1,
                    format!(
                        "{total_in_window} approvals in {}s, dominant tool at {same_tool_percent:.1}%",
                        config.perm_storm_window_seconds
                    ),
                );
            } else {
                self.clear_pattern(state, StuckPattern::PermissionStorm);
            }
        } else {
            self.clear_pattern(state, StuckPattern::PermissionStorm);
        }
    }

    fn check_subagent_churn(&self, config: &ObserverConfig, state: &mut ObserverState) {
        if !config.subagent_churn_enabled {
            return;
        }
        let window_start = Utc::now() - TimeDelta::seconds(config.subagent_churn_window_seconds);

        let mut total_stopped = 0usize;
        let mut completed = 0usize;
        for (ts, did_complete) in &state.subagent_lifecycles {
            if *ts >= window_start {
                total_stopped += 1;
                if *did_complete {
                    completed += 1;
                }
            }
        }

        if total_stopped >= config.subagent_churn_count {
            let completion_percent = completed as f64 / total_stopped as f64 * 100.0;
            if completion_percent < config.subagent_churn_completion_percent {
                self.activate_pattern(
                    config,
                    state,
                    StuckPattern::SubagentChurn,
                    1,
                    format!(
                        "{total_stopped} agents stopped, only {completion_percent:.1}% completed tasks"
                    ),
                );
            } else {
                self.clear_pattern(state, StuckPattern::SubagentChurn);
            }
        } else {
            self.clear_pattern(state, StuckPattern::SubagentChurn);
        }
    }

    // --- Internal helpers ---

    fn activate_pattern(
        &self,
        config: &ObserverConfig,
        state: &mut ObserverState,
        pattern: StuckPattern,
        severity: u8,
        description: String,
    ) {
        let now = Utc::now();
        let in_cooldown = state
            .last_intervention_time
            .get(&pattern)
            .map(|last| (now - *last).num_seconds() < config.intervention_cooldown_secs)
            .unwrap_or(false);
        if in_cooldown {
            return;
        }
        if state.active_events.iter().any(|e| e.pattern == pattern) {
            return;
        }

        let intervention = suggest_intervention(config.policy, severity);
        state.active_events.push(StuckEvent {
            pattern,
            severity,
            description: description.clone(),
            suggested_intervention: intervention,
            detected_at: now,
        });
        state.last_intervention_time.insert(pattern, now);

        info!(?pattern, severity, %description, "stuck pattern detected");
        let _ = self.event_tx.send(ObserverEvent::StuckDetected {
            pattern,
            severity,
            description: description.clone(),
        });
        let _ = self.event_tx.send(ObserverEvent::InterventionSuggested {
            intervention,
            description,
        });
    }

    fn clear_pattern(&self, state: &mut ObserverState, pattern: StuckPattern) {
        if let Some(pos) = state.active_events.iter().position(|e| e.pattern == pattern) {
            state.active_events.remove(pos);
            let _ = self.event_tx.send(ObserverEvent::StuckCleared { pattern });
        }
    }

    fn cleanup_old_entries(&self, config: &ObserverConfig, state: &mut ObserverState) {
        let now = Utc::now();

        let error_cutoff = now - TimeDelta::seconds(config.error_loop_window_seconds);
        state.error_signatures.retain(|(ts, _)| *ts >= error_cutoff);

        let approval_cutoff = now - TimeDelta::seconds(config.perm_storm_window_seconds);
        state.recent_approvals.retain(|(ts, _)| *ts >= approval_cutoff);

        let subagent_cutoff = now - TimeDelta::seconds(config.subagent_churn_window_seconds);
        state
            .subagent_lifecycles
            .retain(|(ts, _)| *ts >= subagent_cutoff);

        // Cap work cycles to the last 20.
        let excess = state.work_cycles.len().saturating_sub(20);
        if excess > 0 {
            state.work_cycles.drain(..excess);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ObserverState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn suggest_intervention(policy: ObserverPolicy, severity: u8) -> Intervention {
    match policy {
        ObserverPolicy::NotifyOnly => Intervention::Notify,
        ObserverPolicy::AutoDowngrade => {
            if severity >= 2 {
                Intervention::Pause
            } else {
                Intervention::Adjust
            }
        }
        ObserverPolicy::AutoRedirect => Intervention::Redirect,
        ObserverPolicy::FullAuto => {
            if severity >= 3 {
                Intervention::Restart
            } else {
                Intervention::Redirect
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observer_with(config: ObserverConfig) -> SessionObserver {
        SessionObserver::new(config)
    }

    fn zero_cooldown_config() -> ObserverConfig {
        ObserverConfig {
            intervention_cooldown_secs: 0,
            ..ObserverConfig::default()
        }
    }

    /// Fast Working->Idle cycles also count as error-like transitions, so
    /// tests that target a single detector disable the error loop.
    fn idle_only_config(cooldown_secs: i64) -> ObserverConfig {
        ObserverConfig {
            error_loop_enabled: false,
            intervention_cooldown_secs: cooldown_secs,
            ..ObserverConfig::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ObserverEvent>) -> Vec<ObserverEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drive one fast Working->Idle cycle with the given token delta.
    fn run_cycle(observer: &SessionObserver, token_base: &mut u64, delta: u64) {
        observer.on_state_changed(AgentState::Working);
        *token_base += delta;
        observer.on_token_usage(*token_base, 0, *token_base, 0.0);
        observer.on_state_changed(AgentState::Idle);
    }

    #[test]
    fn idle_loop_detected_after_three_empty_cycles() {
        let observer = observer_with(idle_only_config(0));
        let mut rx = observer.subscribe();
        let mut tokens = 0;

        run_cycle(&observer, &mut tokens, 0);
        run_cycle(&observer, &mut tokens, 0);
        assert!(drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, ObserverEvent::StuckDetected { .. })));

        run_cycle(&observer, &mut tokens, 0);
        let events = drain(&mut rx);
        let detected = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ObserverEvent::StuckDetected {
                        pattern: StuckPattern::IdleLoop,
                        severity: 1,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(detected, 1);
        assert_eq!(observer.composed_severity(), 1);
    }

    #[test]
    fn idle_loop_suppressed_by_token_progress() {
        let observer = observer_with(zero_cooldown_config());
        let mut rx = observer.subscribe();
        let mut tokens = 0;

        for _ in 0..3 {
            run_cycle(&observer, &mut tokens, 10_000);
        }
        assert!(drain(&mut rx).iter().all(|e| !matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::IdleLoop,
                ..
            }
        )));
    }

    #[test]
    fn error_loop_on_repeated_errors() {
        let observer = observer_with(zero_cooldown_config());
        let mut rx = observer.subscribe();

        observer.on_state_changed(AgentState::Error);
        observer.on_state_changed(AgentState::Working);
        observer.on_state_changed(AgentState::Error);
        observer.on_state_changed(AgentState::Working);
        observer.on_state_changed(AgentState::Error);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::ErrorLoop,
                severity: 2,
                ..
            }
        )));
    }

    #[test]
    fn cost_spiral_within_window() {
        let observer = observer_with(zero_cooldown_config());
        let mut rx = observer.subscribe();

        // First update starts the window; second blows through both thresholds.
        observer.on_token_usage(0, 0, 0, 0.0);
        observer.on_token_usage(150_000, 0, 150_000, 2.0);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::CostSpiral,
                severity: 2,
                ..
            }
        )));
    }

    #[test]
    fn context_rot_needs_three_baseline_samples() {
        let observer = observer_with(zero_cooldown_config());
        let mut rx = observer.subscribe();

        // One baseline sample, then a degraded high-input reading: the
        // baseline is still only two samples deep, so nothing may fire.
        observer.on_token_usage(100, 50, 150, 0.0);
        observer.on_token_usage(900_000, 1_000, 901_000, 0.0);
        assert!(drain(&mut rx).iter().all(|e| !matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::ContextRot,
                ..
            }
        )));

        // The next reading completes the three-sample baseline and the
        // degraded ratio fires.
        observer.on_token_usage(900_000, 900, 900_900, 0.0);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::ContextRot,
                ..
            }
        )));
    }

    #[test]
    fn context_rot_quiet_when_ratio_holds() {
        let observer = observer_with(zero_cooldown_config());
        let mut rx = observer.subscribe();

        observer.on_token_usage(100, 50, 150, 0.0);
        observer.on_token_usage(100, 50, 150, 0.0);
        observer.on_token_usage(100, 50, 150, 0.0);
        // Ratio still 0.5 at high input: healthy.
        observer.on_token_usage(900_000, 450_000, 1_350_000, 0.0);
        assert!(drain(&mut rx).iter().all(|e| !matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::ContextRot,
                ..
            }
        )));
    }

    #[test]
    fn permission_storm_dominant_tool() {
        let observer = observer_with(zero_cooldown_config());
        let mut rx = observer.subscribe();
        let now = Utc::now();

        for _ in 0..9 {
            observer.on_approval_logged("Bash", now);
        }
        observer.on_approval_logged("Edit", now);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::PermissionStorm,
                severity: 1,
                ..
            }
        )));
    }

    #[test]
    fn permission_storm_needs_dominance() {
        let observer = observer_with(zero_cooldown_config());
        let mut rx = observer.subscribe();
        let now = Utc::now();

        // 10 approvals spread evenly across 4 tools: no storm.
        for tool in ["Bash", "Edit", "Read", "Write"] {
            observer.on_approval_logged(tool, now);
            observer.on_approval_logged(tool, now);
        }
        observer.on_approval_logged("Bash", now);
        observer.on_approval_logged("Edit", now);

        assert!(drain(&mut rx).iter().all(|e| !matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::PermissionStorm,
                ..
            }
        )));
    }

    #[test]
    fn subagent_churn_on_fast_stops() {
        let observer = observer_with(zero_cooldown_config());
        let mut rx = observer.subscribe();

        for i in 0..5 {
            let id = format!("agent-{i}");
            observer.on_subagent_started(&id);
            observer.on_subagent_stopped(&id); // stops immediately, no completion
        }

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ObserverEvent::StuckDetected {
                pattern: StuckPattern::SubagentChurn,
                severity: 1,
                ..
            }
        )));
    }

    #[test]
    fn cooldown_suppresses_reactivation() {
        let observer = observer_with(idle_only_config(3600));
        let mut rx = observer.subscribe();
        let mut tokens = 0;

        for _ in 0..3 {
            run_cycle(&observer, &mut tokens, 0);
        }
        let first = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, ObserverEvent::StuckDetected { .. }))
            .count();
        assert_eq!(first, 1);

        // A productive cycle clears; three more empty ones are inside the
        // cooldown window and stay silent.
        run_cycle(&observer, &mut tokens, 10_000);
        for _ in 0..3 {
            run_cycle(&observer, &mut tokens, 0);
        }
        let again = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, ObserverEvent::StuckDetected { .. }))
            .count();
        assert_eq!(again, 0);
    }

    #[test]
    fn reset_keeps_cooldowns() {
        let observer = observer_with(idle_only_config(3600));
        let mut rx = observer.subscribe();
        let mut tokens = 0;

        for _ in 0..3 {
            run_cycle(&observer, &mut tokens, 0);
        }
        assert_eq!(observer.composed_severity(), 1);

        observer.reset();
        assert_eq!(observer.composed_severity(), 0);
        drain(&mut rx);

        // Same pattern immediately after reset: still inside cooldown.
        let mut tokens = 0;
        for _ in 0..3 {
            run_cycle(&observer, &mut tokens, 0);
        }
        assert!(drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, ObserverEvent::StuckDetected { .. })));
    }

    #[test]
    fn intervention_policy_mapping() {
        assert_eq!(
            suggest_intervention(ObserverPolicy::NotifyOnly, 3),
            Intervention::Notify
        );
        assert_eq!(
            suggest_intervention(ObserverPolicy::AutoDowngrade, 2),
            Intervention::Pause
        );
        assert_eq!(
            suggest_intervention(ObserverPolicy::AutoDowngrade, 1),
            Intervention::Adjust
        );
        assert_eq!(
            suggest_intervention(ObserverPolicy::AutoRedirect, 1),
            Intervention::Redirect
        );
        assert_eq!(
            suggest_intervention(ObserverPolicy::FullAuto, 3),
            Intervention::Restart
        );
        assert_eq!(
            suggest_intervention(ObserverPolicy::FullAuto, 2),
            Intervention::Redirect
        );
    }

    #[test]
    fn composed_severity_sums_active_events() {
        let observer = observer_with(zero_cooldown_config());
        let mut tokens = 0;

        // IdleLoop (1) + ErrorLoop (2) both active.
        for _ in 0..3 {
            run_cycle(&observer, &mut tokens, 0);
        }
        // The three Working->Idle transitions above also count as error-like
        // signatures, so ErrorLoop is active too.
        assert_eq!(observer.composed_severity(), 3);
    }
}
