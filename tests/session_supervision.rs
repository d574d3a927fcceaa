//! Cross-component supervision scenarios: budget gating of autonomy,
//! observer interventions, and the session's aggregated event stream.

use std::time::Duration;

use konsolai::agent::{AgentState, TokenUsage};
use konsolai::budget::{BudgetEvent, BudgetKind, SessionBudget};
use konsolai::observer::{Intervention, ObserverConfig, ObserverEvent};
use konsolai::session::{ClaudeSession, SessionEvent};
use konsolai::settings::KonsolaiSettings;

fn test_session() -> std::sync::Arc<ClaudeSession> {
    let session = ClaudeSession::new("default", "/tmp", &KonsolaiSettings::default()).unwrap();
    session.wire_events();
    session
}

async fn settle() {
    // Give the session's pump tasks a chance to drain their channels.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn budget_exceeded_blocks_autonomy() {
    let session = test_session();
    session.budget_controller().set_budget(SessionBudget {
        cost_ceiling_usd: 1.0,
        ..Default::default()
    });

    session.update_token_usage(TokenUsage {
        output_tokens: 10_000, // ~$0.15
        ..Default::default()
    });
    assert!(!session.autonomy().blocked());

    session.update_token_usage(TokenUsage {
        output_tokens: 100_000, // $1.50, over the ceiling
        ..Default::default()
    });
    assert!(session.budget_controller().should_block_yolo());
    assert!(session.autonomy().blocked());
}

#[tokio::test]
async fn budget_warning_then_exceeded_order() {
    let session = test_session();
    let mut rx = session.budget_controller().subscribe();
    session.budget_controller().set_budget(SessionBudget {
        cost_ceiling_usd: 1.0,
        ..Default::default()
    });

    for output_tokens in [33_000u64, 57_000, 60_000, 74_000] {
        session.update_token_usage(TokenUsage {
            output_tokens,
            ..Default::default()
        });
    }

    let mut meaningful = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if !matches!(event, BudgetEvent::VelocityUpdated) {
            meaningful.push(event);
        }
    }
    assert_eq!(meaningful.len(), 2);
    assert!(matches!(
        meaningful[0],
        BudgetEvent::Warning {
            kind: BudgetKind::Cost,
            ..
        }
    ));
    assert!(matches!(
        meaningful[1],
        BudgetEvent::Exceeded {
            kind: BudgetKind::Cost
        }
    ));
}

/// Drive one fast Working->Idle cycle through the session's state machine.
///
/// The settles keep the async signal pump in step with the synchronous token
/// updates, so the observer sees Working before the tokens land and the
/// tokens before Idle.
async fn run_cycle(session: &ClaudeSession, tokens: &mut u64, delta: u64) {
    session
        .state_machine()
        .handle_hook_event("PreToolUse", r#"{"tool_name":"Bash"}"#);
    settle().await;
    *tokens += delta;
    session.update_token_usage(TokenUsage {
        input_tokens: *tokens,
        ..Default::default()
    });
    session.state_machine().handle_hook_event("Stop", "{}");
    settle().await;
}

#[tokio::test]
async fn observer_intervention_pauses_then_releases_autonomy() {
    let session = test_session();
    // Isolate the idle-loop detector so the release edge is observable.
    session.observer().set_config(ObserverConfig {
        error_loop_enabled: false,
        cost_spiral_enabled: false,
        intervention_cooldown_secs: 0,
        ..ObserverConfig::default()
    });

    let mut tokens = 0;
    for _ in 0..3 {
        run_cycle(&session, &mut tokens, 0).await;
    }
    settle().await;

    // IdleLoop active: AutoRedirect policy suggested a Redirect, which the
    // session turns into an autonomy block.
    assert_eq!(session.observer().composed_severity(), 1);
    assert!(session.autonomy().blocked());

    // A productive cycle clears the pattern; severity back at zero releases
    // the block.
    run_cycle(&session, &mut tokens, 50_000).await;
    settle().await;
    assert_eq!(session.observer().composed_severity(), 0);
    assert!(!session.autonomy().blocked());
}

#[tokio::test]
async fn stuck_events_surface_on_session_stream() {
    let session = test_session();
    session.observer().set_config(ObserverConfig {
        error_loop_enabled: false,
        cost_spiral_enabled: false,
        intervention_cooldown_secs: 0,
        ..ObserverConfig::default()
    });
    let mut rx = session.subscribe();

    let mut tokens = 0;
    for _ in 0..3 {
        run_cycle(&session, &mut tokens, 0).await;
    }
    settle().await;

    let mut saw_stuck = false;
    let mut saw_intervention = false;
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::Stuck(observer_event) = event {
            match observer_event {
                ObserverEvent::StuckDetected { severity, .. } => {
                    assert!(severity >= 1);
                    saw_stuck = true;
                }
                ObserverEvent::InterventionSuggested { intervention, .. } => {
                    assert_eq!(intervention, Intervention::Redirect);
                    saw_intervention = true;
                }
                ObserverEvent::StuckCleared { .. } => {}
            }
        }
    }
    assert!(saw_stuck);
    assert!(saw_intervention);
}

#[tokio::test]
async fn state_changes_fan_out_to_session_subscribers() {
    let session = test_session();
    let mut rx = session.subscribe();

    session
        .state_machine()
        .handle_hook_event("PreToolUse", r#"{"tool_name":"Edit"}"#);
    session.state_machine().handle_hook_event("Stop", "{}");
    settle().await;

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(states, vec![AgentState::Working, AgentState::Idle]);
}
