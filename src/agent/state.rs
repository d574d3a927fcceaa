//! Agent state machine fed by hook events.
//!
//! The resulting state is a function of (previous state, event type, event
//! fields) only; `StateChanged` is edge-triggered.

use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::AgentState;

/// Signals emitted by the state machine as hook events are digested.
#[derive(Debug, Clone)]
pub enum AgentSignal {
    StateChanged(AgentState),
    TaskStarted(String),
    TaskFinished,
    ToolUseCompleted {
        tool_name: String,
        response: String,
    },
    PermissionRequested {
        tool_name: String,
        tool_input: String,
    },
    /// A `PermissionRequest` the sidecar already answered via the yolo sentinel.
    YoloApprovalOccurred {
        tool_name: String,
        tool_input: String,
    },
    NotificationReceived {
        kind: String,
        message: String,
    },
    SubagentStarted {
        agent_id: String,
        agent_type: String,
        transcript_path: String,
    },
    SubagentStopped {
        agent_id: String,
        agent_type: String,
        transcript_path: String,
    },
    TeammateIdle {
        teammate_name: String,
        team_name: String,
    },
    TaskCompleted {
        task_id: String,
        task_subject: String,
        teammate_name: String,
        team_name: String,
    },
}

/// Maps hook events onto the six-state agent model.
pub struct AgentStateMachine {
    state: RwLock<AgentState>,
    current_task: RwLock<String>,
    signal_tx: broadcast::Sender<AgentSignal>,
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStateMachine {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(AgentState::NotRunning),
            current_task: RwLock::new(String::new()),
            signal_tx,
        }
    }

    pub fn state(&self) -> AgentState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_task(&self) -> String {
        self.current_task
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentSignal> {
        self.signal_tx.subscribe()
    }

    /// Set the state, emitting `StateChanged` only on an actual transition.
    pub fn set_state(&self, new_state: AgentState) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != new_state {
            *state = new_state;
            drop(state);
            let _ = self.signal_tx.send(AgentSignal::StateChanged(new_state));
        }
    }

    /// Set the current task description, emitting `TaskStarted` when nonempty.
    pub fn set_current_task(&self, task: &str) {
        if let Ok(mut current) = self.current_task.write() {
            *current = task.to_string();
        }
        if !task.is_empty() {
            let _ = self
                .signal_tx
                .send(AgentSignal::TaskStarted(task.to_string()));
        }
    }

    fn clear_task(&self) {
        if let Ok(mut current) = self.current_task.write() {
            current.clear();
        }
        let _ = self.signal_tx.send(AgentSignal::TaskFinished);
    }

    /// Digest one hook event. `event_data` is the frame's JSON payload.
    pub fn handle_hook_event(&self, event_type: &str, event_data: &str) {
        let data: Value = match serde_json::from_str(event_data) {
            Ok(value) => value,
            Err(err) => {
                warn!(event_type, error = %err, "invalid JSON in hook event");
                Value::Null
            }
        };

        match event_type {
            "Stop" => {
                self.set_state(AgentState::Idle);
                self.clear_task();
            }
            "PreToolUse" => {
                self.set_state(AgentState::Working);
                let tool_name = str_field(&data, "tool_name");
                self.set_current_task(&format!("Using tool: {tool_name}"));
            }
            "PostToolUse" => {
                let tool_name = str_field(&data, "tool_name");
                let response = rendered_field(&data, "tool_response");
                if !tool_name.is_empty() {
                    let _ = self.signal_tx.send(AgentSignal::ToolUseCompleted {
                        tool_name,
                        response,
                    });
                }
            }
            "PermissionRequest" => {
                let tool_name = str_field(&data, "tool_name");
                let tool_input = rendered_field(&data, "tool_input");
                let yolo_approved = data
                    .get("yolo_approved")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                if yolo_approved {
                    debug!(tool = %tool_name, "permission pre-approved by yolo sentinel");
                    let _ = self.signal_tx.send(AgentSignal::YoloApprovalOccurred {
                        tool_name,
                        tool_input,
                    });
                } else {
                    self.set_state(AgentState::WaitingInput);
                    let _ = self.signal_tx.send(AgentSignal::PermissionRequested {
                        tool_name,
                        tool_input,
                    });
                }
            }
            "Notification" => {
                let kind = str_field(&data, "type");
                let message = str_field(&data, "message");

                match kind.as_str() {
                    "permission_request" | "permission" | "permission_required" => {
                        self.set_state(AgentState::WaitingInput);
                        let _ = self.signal_tx.send(AgentSignal::PermissionRequested {
                            tool_name: str_field(&data, "action"),
                            tool_input: str_field(&data, "description"),
                        });
                    }
                    "idle_prompt" | "idle" => {
                        self.set_state(AgentState::WaitingInput);
                    }
                    // Unrecognized notification types are forwarded without a
                    // state change.
                    _ => {}
                }

                let _ = self
                    .signal_tx
                    .send(AgentSignal::NotificationReceived { kind, message });
            }
            "SubagentStart" => {
                let _ = self.signal_tx.send(AgentSignal::SubagentStarted {
                    agent_id: str_field(&data, "agent_id"),
                    agent_type: str_field_fallback(&data, "agent_type", "subagent_type"),
                    transcript_path: str_field(&data, "transcript_path"),
                });
            }
            "SubagentStop" => {
                let _ = self.signal_tx.send(AgentSignal::SubagentStopped {
                    agent_id: str_field(&data, "agent_id"),
                    agent_type: str_field_fallback(&data, "agent_type", "subagent_type"),
                    transcript_path: str_field(&data, "agent_transcript_path"),
                });
            }
            "TeammateIdle" => {
                let _ = self.signal_tx.send(AgentSignal::TeammateIdle {
                    teammate_name: str_field_fallback(&data, "teammate_name", "name"),
                    team_name: str_field(&data, "team_name"),
                });
            }
            "TaskCompleted" => {
                let _ = self.signal_tx.send(AgentSignal::TaskCompleted {
                    task_id: str_field(&data, "task_id"),
                    task_subject: str_field_fallback(&data, "task_subject", "subject"),
                    teammate_name: str_field_fallback(&data, "teammate_name", "name"),
                    team_name: str_field(&data, "team_name"),
                });
            }
            other => {
                debug!(event_type = other, "unknown hook event type, dropped");
            }
        }
    }
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Read `key` falling back to `fallback` when absent or empty.
fn str_field_fallback(data: &Value, key: &str, fallback: &str) -> String {
    let value = str_field(data, key);
    if value.is_empty() {
        str_field(data, fallback)
    } else {
        value
    }
}

/// Render a field that may be a JSON object (pretty-printed) or a string.
fn rendered_field(data: &Value, key: &str) -> String {
    match data.get(key) {
        Some(Value::Object(obj)) => {
            serde_json::to_string_pretty(obj).unwrap_or_default()
        }
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_signals(rx: &mut broadcast::Receiver<AgentSignal>) -> Vec<AgentSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        signals
    }

    #[test]
    fn initial_state_is_not_running() {
        let machine = AgentStateMachine::new();
        assert_eq!(machine.state(), AgentState::NotRunning);
        assert!(machine.current_task().is_empty());
    }

    #[test]
    fn stop_goes_idle_and_clears_task() {
        let machine = AgentStateMachine::new();
        let mut rx = machine.subscribe();

        machine.handle_hook_event("PreToolUse", r#"{"tool_name":"Bash"}"#);
        assert_eq!(machine.state(), AgentState::Working);
        assert_eq!(machine.current_task(), "Using tool: Bash");

        machine.handle_hook_event("Stop", "{}");
        assert_eq!(machine.state(), AgentState::Idle);
        assert!(machine.current_task().is_empty());

        let signals = drain_signals(&mut rx);
        assert!(signals
            .iter()
            .any(|s| matches!(s, AgentSignal::TaskFinished)));
    }

    #[test]
    fn post_tool_use_keeps_state() {
        let machine = AgentStateMachine::new();
        machine.handle_hook_event("PreToolUse", r#"{"tool_name":"Edit"}"#);
        machine.handle_hook_event(
            "PostToolUse",
            r#"{"tool_name":"Edit","tool_response":{"ok":true}}"#,
        );
        assert_eq!(machine.state(), AgentState::Working);
    }

    #[test]
    fn state_traversal_for_tool_cycle() {
        // NotRunning -> Working -> Working -> Idle
        let machine = AgentStateMachine::new();
        let mut rx = machine.subscribe();

        machine.handle_hook_event("PreToolUse", r#"{"tool_name":"Bash"}"#);
        machine.handle_hook_event("PostToolUse", r#"{"tool_name":"Bash"}"#);
        machine.handle_hook_event("Stop", "{}");

        let states: Vec<AgentState> = drain_signals(&mut rx)
            .into_iter()
            .filter_map(|s| match s {
                AgentSignal::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![AgentState::Working, AgentState::Idle]);
    }

    #[test]
    fn permission_request_waits_for_input() {
        let machine = AgentStateMachine::new();
        let mut rx = machine.subscribe();

        machine.handle_hook_event(
            "PermissionRequest",
            r#"{"tool_name":"Bash","tool_input":{"command":"ls"}}"#,
        );
        assert_eq!(machine.state(), AgentState::WaitingInput);

        let signals = drain_signals(&mut rx);
        assert!(signals.iter().any(
            |s| matches!(s, AgentSignal::PermissionRequested { tool_name, .. } if tool_name == "Bash")
        ));
    }

    #[test]
    fn yolo_approved_permission_keeps_state() {
        let machine = AgentStateMachine::new();
        machine.handle_hook_event("PreToolUse", r#"{"tool_name":"Bash"}"#);
        let mut rx = machine.subscribe();

        machine.handle_hook_event(
            "PermissionRequest",
            r#"{"tool_name":"Bash","yolo_approved":true}"#,
        );
        assert_eq!(machine.state(), AgentState::Working);

        let signals = drain_signals(&mut rx);
        assert!(signals
            .iter()
            .any(|s| matches!(s, AgentSignal::YoloApprovalOccurred { .. })));
        assert!(!signals
            .iter()
            .any(|s| matches!(s, AgentSignal::StateChanged(_))));
    }

    #[test]
    fn notification_variants() {
        let machine = AgentStateMachine::new();
        let mut rx = machine.subscribe();

        machine.handle_hook_event(
            "Notification",
            r#"{"type":"permission_required","action":"run","description":"ls"}"#,
        );
        assert_eq!(machine.state(), AgentState::WaitingInput);

        machine.set_state(AgentState::Working);
        machine.handle_hook_event("Notification", r#"{"type":"idle_prompt"}"#);
        assert_eq!(machine.state(), AgentState::WaitingInput);

        // Unknown notification type: forwarded, no state change.
        machine.set_state(AgentState::Working);
        machine.handle_hook_event(
            "Notification",
            r#"{"type":"celebration","message":"done"}"#,
        );
        assert_eq!(machine.state(), AgentState::Working);

        let notifications = drain_signals(&mut rx)
            .into_iter()
            .filter(|s| matches!(s, AgentSignal::NotificationReceived { .. }))
            .count();
        assert_eq!(notifications, 3);
    }

    #[test]
    fn subagent_field_fallbacks() {
        let machine = AgentStateMachine::new();
        let mut rx = machine.subscribe();

        machine.handle_hook_event(
            "SubagentStart",
            r#"{"agent_id":"a1","subagent_type":"researcher"}"#,
        );
        let signals = drain_signals(&mut rx);
        match &signals[0] {
            AgentSignal::SubagentStarted {
                agent_id,
                agent_type,
                ..
            } => {
                assert_eq!(agent_id, "a1");
                assert_eq!(agent_type, "researcher");
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn teammate_and_task_fallbacks() {
        let machine = AgentStateMachine::new();
        let mut rx = machine.subscribe();

        machine.handle_hook_event("TeammateIdle", r#"{"name":"casey"}"#);
        machine.handle_hook_event(
            "TaskCompleted",
            r#"{"task_id":"7","subject":"Fix tests","name":"casey"}"#,
        );

        let signals = drain_signals(&mut rx);
        assert!(matches!(
            &signals[0],
            AgentSignal::TeammateIdle { teammate_name, .. } if teammate_name == "casey"
        ));
        assert!(matches!(
            &signals[1],
            AgentSignal::TaskCompleted { task_subject, .. } if task_subject == "Fix tests"
        ));
    }

    #[test]
    fn unknown_event_is_dropped() {
        let machine = AgentStateMachine::new();
        let mut rx = machine.subscribe();
        machine.handle_hook_event("SomethingNew", "{}");
        assert!(drain_signals(&mut rx).is_empty());
        assert_eq!(machine.state(), AgentState::NotRunning);
    }

    #[test]
    fn state_changed_is_edge_triggered() {
        let machine = AgentStateMachine::new();
        let mut rx = machine.subscribe();

        machine.set_state(AgentState::Idle);
        machine.set_state(AgentState::Idle);
        machine.set_state(AgentState::Working);

        let states: Vec<AgentState> = drain_signals(&mut rx)
            .into_iter()
            .filter_map(|s| match s {
                AgentSignal::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![AgentState::Idle, AgentState::Working]);
    }
}
