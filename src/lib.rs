//! konsolai - supervisory control plane for Claude Code sessions in tmux
//!
//! Each session runs the Claude CLI inside a detachable tmux session so the
//! agent survives UI restarts. On top of that persistence layer the crate
//! tracks agent state from hook events, enforces time/cost/token budgets,
//! detects stuck patterns, auto-approves permission prompts per a tiered
//! autonomy policy, scores prompts before dispatch, and runs fire-and-forget
//! one-shot sessions.

pub mod agent;
pub mod budget;
pub mod error;
pub mod notification;
pub mod observer;
pub mod oneshot;
pub mod prompt;
pub mod resource;
pub mod session;
pub mod settings;
pub mod template;
pub mod tmux;
pub mod util;

pub use error::KonsolaiError;
pub use session::{ClaudeSession, SessionRegistry, SessionState};

/// Initialize tracing for embedders and binaries; respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
