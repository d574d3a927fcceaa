//! User-facing notification dispatch.
//!
//! Concrete sinks (tray status, popup, audio, in-terminal) live outside this
//! crate; they implement [`Notifier`] and register with the manager. The
//! manager applies per-kind enablement and a do-not-disturb switch before
//! fanning out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::info;

use crate::agent::AgentState;
use crate::budget::BudgetKind;
use crate::observer::StuckPattern;

/// Classification used for per-kind enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    StateChanged,
    PermissionRequested,
    TaskCompleted,
    BudgetWarning,
    BudgetExceeded,
    StuckDetected,
    SessionEnded,
}

/// A user-facing event, tagged with the originating session.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    StateChanged {
        session_name: String,
        state: AgentState,
    },
    PermissionRequested {
        session_name: String,
        tool_name: String,
    },
    TaskCompleted {
        session_name: String,
        subject: String,
    },
    BudgetWarning {
        session_name: String,
        kind: BudgetKind,
        percent: f64,
    },
    BudgetExceeded {
        session_name: String,
        kind: BudgetKind,
    },
    StuckDetected {
        session_name: String,
        pattern: StuckPattern,
        severity: u8,
        description: String,
    },
    SessionEnded {
        session_name: String,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationEvent::StateChanged { .. } => NotificationKind::StateChanged,
            NotificationEvent::PermissionRequested { .. } => NotificationKind::PermissionRequested,
            NotificationEvent::TaskCompleted { .. } => NotificationKind::TaskCompleted,
            NotificationEvent::BudgetWarning { .. } => NotificationKind::BudgetWarning,
            NotificationEvent::BudgetExceeded { .. } => NotificationKind::BudgetExceeded,
            NotificationEvent::StuckDetected { .. } => NotificationKind::StuckDetected,
            NotificationEvent::SessionEnded { .. } => NotificationKind::SessionEnded,
        }
    }

    pub fn session_name(&self) -> &str {
        match self {
            NotificationEvent::StateChanged { session_name, .. }
            | NotificationEvent::PermissionRequested { session_name, .. }
            | NotificationEvent::TaskCompleted { session_name, .. }
            | NotificationEvent::BudgetWarning { session_name, .. }
            | NotificationEvent::BudgetExceeded { session_name, .. }
            | NotificationEvent::StuckDetected { session_name, .. }
            | NotificationEvent::SessionEnded { session_name } => session_name,
        }
    }
}

/// Abstract notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent);

    /// Identifier used for deregistration.
    fn id(&self) -> &str;
}

/// Fans events out to registered sinks.
pub struct NotificationManager {
    sinks: RwLock<Vec<std::sync::Arc<dyn Notifier>>>,
    disabled_kinds: RwLock<HashSet<NotificationKind>>,
    do_not_disturb: AtomicBool,
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationManager {
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            disabled_kinds: RwLock::new(HashSet::new()),
            do_not_disturb: AtomicBool::new(false),
        }
    }

    pub fn add_sink(&self, sink: std::sync::Arc<dyn Notifier>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    pub fn remove_sink(&self, id: &str) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.retain(|s| s.id() != id);
        }
    }

    pub fn set_kind_enabled(&self, kind: NotificationKind, enabled: bool) {
        if let Ok(mut disabled) = self.disabled_kinds.write() {
            if enabled {
                disabled.remove(&kind);
            } else {
                disabled.insert(kind);
            }
        }
    }

    pub fn set_do_not_disturb(&self, enabled: bool) {
        self.do_not_disturb.store(enabled, Ordering::Relaxed);
    }

    pub fn is_kind_enabled(&self, kind: NotificationKind) -> bool {
        self.disabled_kinds
            .read()
            .map(|d| !d.contains(&kind))
            .unwrap_or(true)
    }

    /// Deliver an event to every interested sink.
    pub async fn dispatch(&self, event: &NotificationEvent) {
        if self.do_not_disturb.load(Ordering::Relaxed) {
            return;
        }
        if !self.is_kind_enabled(event.kind()) {
            return;
        }
        let sinks: Vec<_> = self
            .sinks
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        for sink in sinks {
            sink.notify(event).await;
        }
    }
}

/// Tracing-backed sink, useful headless and in tests.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotificationEvent) {
        info!(session = event.session_name(), event = ?event, "notification");
    }

    fn id(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingNotifier {
        id: String,
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _event: &NotificationEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        fn id(&self) -> &str {
            &self.id
        }
    }

    fn sample_event() -> NotificationEvent {
        NotificationEvent::PermissionRequested {
            session_name: "konsolai-default-a1b2c3d4".to_string(),
            tool_name: "Bash".to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_sinks() {
        let manager = NotificationManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        manager.add_sink(Arc::new(CountingNotifier {
            id: "c".to_string(),
            count: Arc::clone(&count),
        }));

        manager.dispatch(&sample_event()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_kind_is_filtered() {
        let manager = NotificationManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        manager.add_sink(Arc::new(CountingNotifier {
            id: "c".to_string(),
            count: Arc::clone(&count),
        }));

        manager.set_kind_enabled(NotificationKind::PermissionRequested, false);
        manager.dispatch(&sample_event()).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        manager.set_kind_enabled(NotificationKind::PermissionRequested, true);
        manager.dispatch(&sample_event()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn do_not_disturb_silences_everything() {
        let manager = NotificationManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        manager.add_sink(Arc::new(CountingNotifier {
            id: "c".to_string(),
            count: Arc::clone(&count),
        }));

        manager.set_do_not_disturb(true);
        manager.dispatch(&sample_event()).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    mockall::mock! {
        pub Sink {}

        #[async_trait]
        impl Notifier for Sink {
            async fn notify(&self, event: &NotificationEvent);
            fn id(&self) -> &str;
        }
    }

    #[tokio::test]
    async fn mocked_sink_sees_exactly_one_event() {
        let manager = NotificationManager::new();
        let mut sink = MockSink::new();
        sink.expect_notify().times(1).return_const(());
        sink.expect_id().return_const("mock".to_string());
        manager.add_sink(Arc::new(sink));

        manager.dispatch(&sample_event()).await;
    }

    #[tokio::test]
    async fn remove_sink_by_id() {
        let manager = NotificationManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        manager.add_sink(Arc::new(CountingNotifier {
            id: "gone".to_string(),
            count: Arc::clone(&count),
        }));
        manager.remove_sink("gone");
        manager.dispatch(&sample_event()).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
