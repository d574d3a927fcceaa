//! Session budgets: time/cost/token ceilings, token velocity, resource gate.
//!
//! The controller monitors usage updates and a 60-second time check, emits a
//! warning once per dimension at the configured threshold and an exceeded
//! event once per dimension at the ceiling, and blocks autonomy while any
//! dimension is exceeded or the resource gate is triggered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::TokenUsage;
use crate::resource::{ResourceMonitor, ResourceUsage};

/// Soft budgets notify; hard budgets are meant to stop the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BudgetPolicy {
    #[default]
    Soft,
    Hard,
}

/// Budget dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetKind {
    Time,
    Cost,
    Token,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetKind::Time => write!(f, "time"),
            BudgetKind::Cost => write!(f, "cost"),
            BudgetKind::Token => write!(f, "token"),
        }
    }
}

/// Budget limits for a session. Zero on a dimension means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionBudget {
    pub time_limit_minutes: u32,
    #[serde(rename = "costCeilingUSD")]
    pub cost_ceiling_usd: f64,
    pub token_ceiling: u64,
    pub time_policy: BudgetPolicy,
    pub cost_policy: BudgetPolicy,
    pub token_policy: BudgetPolicy,
    pub warning_threshold_percent: f64,
    pub time_exceeded: bool,
    pub cost_exceeded: bool,
    pub token_exceeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for SessionBudget {
    fn default() -> Self {
        Self {
            time_limit_minutes: 0,
            cost_ceiling_usd: 0.0,
            token_ceiling: 0,
            time_policy: BudgetPolicy::Soft,
            cost_policy: BudgetPolicy::Soft,
            token_policy: BudgetPolicy::Soft,
            warning_threshold_percent: 80.0,
            time_exceeded: false,
            cost_exceeded: false,
            token_exceeded: false,
            started_at: None,
        }
    }
}

impl SessionBudget {
    pub fn has_any_limit(&self) -> bool {
        self.time_limit_minutes > 0 || self.cost_ceiling_usd > 0.0 || self.token_ceiling > 0
    }

    pub fn elapsed_minutes(&self) -> i64 {
        match self.started_at {
            Some(started) => (Utc::now() - started).num_minutes().max(0),
            None => 0,
        }
    }
}

/// One velocity sample: total tokens and cost at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VelocitySample {
    pub timestamp: DateTime<Utc>,
    pub total_tokens: u64,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
}

/// Ring-buffer velocity tracker: one sample per minute, 2-hour history.
#[derive(Debug, Clone)]
pub struct TokenVelocity {
    samples: Vec<Option<VelocitySample>>,
    head: usize,
    count: usize,
}

impl TokenVelocity {
    pub const MAX_SAMPLES: usize = 120;

    /// Lookback window for the rolling slope, in samples.
    const SLOPE_WINDOW: usize = 5;

    pub fn new() -> Self {
        Self {
            samples: vec![None; Self::MAX_SAMPLES],
            head: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add_sample(&mut self, total_tokens: u64, cost_usd: f64) {
        self.add_sample_at(Utc::now(), total_tokens, cost_usd);
    }

    pub fn add_sample_at(&mut self, timestamp: DateTime<Utc>, total_tokens: u64, cost_usd: f64) {
        self.samples[self.head] = Some(VelocitySample {
            timestamp,
            total_tokens,
            cost_usd,
        });
        self.head = (self.head + 1) % Self::MAX_SAMPLES;
        if self.count < Self::MAX_SAMPLES {
            self.count += 1;
        }
    }

    fn window_endpoints(&self) -> Option<(&VelocitySample, &VelocitySample)> {
        if self.count < 2 {
            return None;
        }
        let lookback = self.count.min(Self::SLOPE_WINDOW);
        let newest = (self.head + Self::MAX_SAMPLES - 1) % Self::MAX_SAMPLES;
        let oldest = (self.head + Self::MAX_SAMPLES - lookback) % Self::MAX_SAMPLES;
        match (&self.samples[oldest], &self.samples[newest]) {
            (Some(oldest), Some(newest)) => Some((oldest, newest)),
            _ => None,
        }
    }

    /// Rolling tokens-per-minute slope over the last 5 samples.
    ///
    /// 0 when the window holds fewer than 2 samples or no time has passed.
    pub fn tokens_per_minute(&self) -> f64 {
        match self.window_endpoints() {
            Some((oldest, newest)) => {
                let minutes =
                    (newest.timestamp - oldest.timestamp).num_milliseconds() as f64 / 60_000.0;
                if minutes <= 0.0 {
                    return 0.0;
                }
                newest.total_tokens.saturating_sub(oldest.total_tokens) as f64 / minutes
            }
            None => 0.0,
        }
    }

    /// Rolling cost-per-minute slope over the last 5 samples.
    pub fn cost_per_minute(&self) -> f64 {
        match self.window_endpoints() {
            Some((oldest, newest)) => {
                let minutes =
                    (newest.timestamp - oldest.timestamp).num_milliseconds() as f64 / 60_000.0;
                if minutes <= 0.0 {
                    return 0.0;
                }
                (newest.cost_usd - oldest.cost_usd) / minutes
            }
            None => 0.0,
        }
    }

    /// Minutes until `ceiling` at the current velocity.
    ///
    /// 0 when already over, -1 when velocity is unknown.
    pub fn estimated_minutes_remaining(&self, ceiling: u64, current: u64) -> f64 {
        if ceiling == 0 || current >= ceiling {
            return 0.0;
        }
        let velocity = self.tokens_per_minute();
        if velocity <= 0.0 {
            return -1.0;
        }
        (ceiling - current) as f64 / velocity
    }

    /// Format as "2.3K/m $0.04/m".
    pub fn format_velocity(&self) -> String {
        let tpm = self.tokens_per_minute();
        let cpm = self.cost_per_minute();
        let token_str = if tpm >= 1000.0 {
            format!("{:.1}K/m", tpm / 1000.0)
        } else {
            format!("{tpm:.0}/m")
        };
        format!("{token_str} ${cpm:.2}/m")
    }
}

impl Default for TokenVelocity {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do when the resource gate trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GateAction {
    #[default]
    PauseYolo,
    ReduceYolo,
    NotifyOnly,
}

/// Debounced throttle that pauses autonomy when CPU or RSS run hot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceGate {
    pub cpu_threshold_percent: f64,
    /// Consecutive hot ticks before the CPU arm trips (30s at 5s sampling).
    pub cpu_debounce_count: u32,
    /// 0 = auto: 80% of physical RAM.
    pub rss_threshold_bytes: u64,
    pub action: GateAction,
    pub current_cpu_exceed_count: u32,
    pub gate_triggered: bool,
}

impl Default for ResourceGate {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 95.0,
            cpu_debounce_count: 6,
            rss_threshold_bytes: 0,
            action: GateAction::PauseYolo,
            current_cpu_exceed_count: 0,
            gate_triggered: false,
        }
    }
}

impl ResourceGate {
    /// Configured RSS threshold, else 80% of physical RAM, else 6.4 GiB.
    pub fn auto_rss_threshold(&self) -> u64 {
        if self.rss_threshold_bytes > 0 {
            return self.rss_threshold_bytes;
        }
        let total = ResourceMonitor::total_memory_bytes();
        if total > 0 {
            return total / 100 * 80;
        }
        6400 * 1024 * 1024
    }
}

/// Events emitted by the budget controller.
#[derive(Debug, Clone)]
pub enum BudgetEvent {
    Warning { kind: BudgetKind, percent: f64 },
    Exceeded { kind: BudgetKind },
    GateTriggered { reason: String },
    GateCleared,
    VelocityUpdated,
}

#[derive(Default)]
struct EmitLatches {
    time_warning: bool,
    cost_warning: bool,
    token_warning: bool,
    time_exceeded: bool,
    cost_exceeded: bool,
    token_exceeded: bool,
}

const TIME_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Monitors session cost, token usage, time, and host resources.
///
/// `should_block_yolo()` is true whenever any budget dimension has been
/// exceeded or the resource gate is triggered.
pub struct BudgetController {
    budget: Mutex<SessionBudget>,
    velocity: Mutex<TokenVelocity>,
    gate: Mutex<ResourceGate>,
    latches: Mutex<EmitLatches>,
    event_tx: broadcast::Sender<BudgetEvent>,
}

impl Default for BudgetController {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetController {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(128);
        Self {
            budget: Mutex::new(SessionBudget::default()),
            velocity: Mutex::new(TokenVelocity::new()),
            gate: Mutex::new(ResourceGate::default()),
            latches: Mutex::new(EmitLatches::default()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BudgetEvent> {
        self.event_tx.subscribe()
    }

    pub fn budget(&self) -> SessionBudget {
        self.budget
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Install a budget, stamping `started_at` and resetting the emit latches.
    pub fn set_budget(&self, mut budget: SessionBudget) {
        if budget.started_at.is_none() {
            budget.started_at = Some(Utc::now());
        }
        if let Ok(mut guard) = self.budget.lock() {
            *guard = budget;
        }
        if let Ok(mut latches) = self.latches.lock() {
            *latches = EmitLatches::default();
        }
    }

    pub fn velocity(&self) -> TokenVelocity {
        self.velocity
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn gate(&self) -> ResourceGate {
        self.gate.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Replace the gate's thresholds, preserving its runtime state.
    pub fn configure_gate(&self, config: ResourceGate) {
        if let Ok(mut gate) = self.gate.lock() {
            let triggered = gate.gate_triggered;
            let exceed = gate.current_cpu_exceed_count;
            *gate = config;
            gate.gate_triggered = triggered;
            gate.current_cpu_exceed_count = exceed;
        }
    }

    /// Feed a token usage update: velocity sample + cost/token ceiling checks.
    pub fn on_token_usage(&self, usage: &TokenUsage) {
        let total = usage.total_tokens();
        let cost = usage.estimated_cost_usd();

        if let Ok(mut velocity) = self.velocity.lock() {
            velocity.add_sample(total, cost);
        }
        let _ = self.event_tx.send(BudgetEvent::VelocityUpdated);

        let mut budget = match self.budget.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut latches = match self.latches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if budget.cost_ceiling_usd > 0.0 {
            let percent = cost / budget.cost_ceiling_usd * 100.0;
            if cost >= budget.cost_ceiling_usd {
                if !budget.cost_exceeded {
                    budget.cost_exceeded = true;
                    if !latches.cost_exceeded {
                        latches.cost_exceeded = true;
                        debug!(cost, ceiling = budget.cost_ceiling_usd, "cost ceiling exceeded");
                        let _ = self.event_tx.send(BudgetEvent::Exceeded {
                            kind: BudgetKind::Cost,
                        });
                    }
                }
            } else if percent >= budget.warning_threshold_percent && !latches.cost_warning {
                latches.cost_warning = true;
                let _ = self.event_tx.send(BudgetEvent::Warning {
                    kind: BudgetKind::Cost,
                    percent,
                });
            }
        }

        if budget.token_ceiling > 0 {
            let percent = total as f64 / budget.token_ceiling as f64 * 100.0;
            if total >= budget.token_ceiling {
                if !budget.token_exceeded {
                    budget.token_exceeded = true;
                    if !latches.token_exceeded {
                        latches.token_exceeded = true;
                        debug!(total, ceiling = budget.token_ceiling, "token ceiling exceeded");
                        let _ = self.event_tx.send(BudgetEvent::Exceeded {
                            kind: BudgetKind::Token,
                        });
                    }
                }
            } else if percent >= budget.warning_threshold_percent && !latches.token_warning {
                latches.token_warning = true;
                let _ = self.event_tx.send(BudgetEvent::Warning {
                    kind: BudgetKind::Token,
                    percent,
                });
            }
        }
    }

    /// Feed a resource sample into the gate.
    pub fn on_resource_usage(&self, usage: &ResourceUsage) {
        let mut gate = match self.gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if usage.cpu_percent >= gate.cpu_threshold_percent {
            gate.current_cpu_exceed_count += 1;
            if !gate.gate_triggered && gate.current_cpu_exceed_count >= gate.cpu_debounce_count {
                gate.gate_triggered = true;
                let reason = format!(
                    "CPU sustained above {:.0}% for {} ticks",
                    gate.cpu_threshold_percent, gate.current_cpu_exceed_count
                );
                debug!(cpu = usage.cpu_percent, "CPU gate triggered");
                let _ = self.event_tx.send(BudgetEvent::GateTriggered { reason });
            }
        } else {
            // CPU back below threshold resets the debounce immediately.
            gate.current_cpu_exceed_count = 0;
            if gate.gate_triggered {
                // Only clear when RSS is also healthy.
                let rss_threshold = gate.auto_rss_threshold();
                if usage.rss_bytes < rss_threshold {
                    gate.gate_triggered = false;
                    debug!("resource gate cleared");
                    let _ = self.event_tx.send(BudgetEvent::GateCleared);
                }
            }
        }

        // The RSS arm trips immediately, no debounce.
        let rss_threshold = gate.auto_rss_threshold();
        if usage.rss_bytes >= rss_threshold && !gate.gate_triggered {
            gate.gate_triggered = true;
            let reason = format!(
                "RSS {} bytes exceeds threshold {} bytes",
                usage.rss_bytes, rss_threshold
            );
            debug!(rss = usage.rss_bytes, "RSS gate triggered");
            let _ = self.event_tx.send(BudgetEvent::GateTriggered { reason });
        }
    }

    /// Re-check the time budget; runs on the 60-second loop.
    pub fn check_time_budget(&self) {
        let mut budget = match self.budget.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut latches = match self.latches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if budget.time_limit_minutes > 0 && budget.started_at.is_some() {
            let elapsed = budget.elapsed_minutes();
            let percent = elapsed as f64 / budget.time_limit_minutes as f64 * 100.0;

            if elapsed >= budget.time_limit_minutes as i64 {
                if !budget.time_exceeded {
                    budget.time_exceeded = true;
                    if !latches.time_exceeded {
                        latches.time_exceeded = true;
                        debug!(elapsed, limit = budget.time_limit_minutes, "time budget exceeded");
                        let _ = self.event_tx.send(BudgetEvent::Exceeded {
                            kind: BudgetKind::Time,
                        });
                    }
                }
            } else if percent >= budget.warning_threshold_percent && !latches.time_warning {
                latches.time_warning = true;
                let _ = self.event_tx.send(BudgetEvent::Warning {
                    kind: BudgetKind::Time,
                    percent,
                });
            }
        }

        let _ = self.event_tx.send(BudgetEvent::VelocityUpdated);
    }

    /// True while any dimension is exceeded or the gate is triggered.
    pub fn should_block_yolo(&self) -> bool {
        let budget_blocked = self
            .budget
            .lock()
            .map(|b| b.time_exceeded || b.cost_exceeded || b.token_exceeded)
            .unwrap_or(false);
        let gate_blocked = self.gate.lock().map(|g| g.gate_triggered).unwrap_or(false);
        budget_blocked || gate_blocked
    }

    /// Spawn the 60-second time-check loop.
    pub fn spawn_time_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIME_CHECK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would re-check a budget installed
            // microseconds ago; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => controller.check_time_budget(),
                }
            }
        })
    }
}
