//! Resource sampling for the budget controller's gate.
//!
//! Tracks the agent process (by pid when known, by name pattern otherwise)
//! and broadcasts CPU/RSS snapshots on a 5-second cadence.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One resource snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceUsage {
    /// CPU usage percentage (0-100, may exceed 100 on multi-core)
    pub cpu_percent: f64,
    /// Resident set size in bytes
    pub rss_bytes: u64,
}

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Name pattern used to find the agent process when no pid is known.
const AGENT_PROCESS_NAME: &str = "claude";

/// Samples CPU and RSS for one session's agent process.
pub struct ResourceMonitor {
    system: Mutex<System>,
    pid: Mutex<Option<u32>>,
    event_tx: broadcast::Sender<ResourceUsage>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
            )),
            pid: Mutex::new(None),
            event_tx,
        }
    }

    /// Pin sampling to a specific process id.
    pub fn set_pid(&self, pid: Option<u32>) {
        if let Ok(mut guard) = self.pid.lock() {
            *guard = pid;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceUsage> {
        self.event_tx.subscribe()
    }

    /// Total physical memory in bytes, for the gate's auto RSS threshold.
    pub fn total_memory_bytes() -> u64 {
        let mut system = System::new_with_specifics(RefreshKind::nothing().with_memory(
            sysinfo::MemoryRefreshKind::nothing().with_ram(),
        ));
        system.refresh_memory();
        system.total_memory()
    }

    /// Take one sample. Returns zeros when the process cannot be found.
    pub fn sample(&self) -> ResourceUsage {
        let pid = self.pid.lock().ok().and_then(|guard| *guard);

        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        if let Some(pid) = pid {
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                return ResourceUsage {
                    cpu_percent: process.cpu_usage() as f64,
                    rss_bytes: process.memory(),
                };
            }
        }

        // No pid (or it vanished): fall back to the heaviest process matching
        // the agent name pattern.
        system
            .processes()
            .values()
            .filter(|process| {
                process
                    .name()
                    .to_str()
                    .map(|name| name.contains(AGENT_PROCESS_NAME))
                    .unwrap_or(false)
            })
            .max_by_key(|process| process.memory())
            .map(|process| ResourceUsage {
                cpu_percent: process.cpu_usage() as f64,
                rss_bytes: process.memory(),
            })
            .unwrap_or_default()
    }

    /// Spawn the sampling loop; each sample is broadcast to subscribers.
    pub fn spawn_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        // sysinfo refresh is blocking work; keep it off the loop.
                        let sampler = Arc::clone(&monitor);
                        let usage = tokio::task::spawn_blocking(move || sampler.sample())
                            .await
                            .unwrap_or_default();
                        debug!(cpu = usage.cpu_percent, rss = usage.rss_bytes, "resource sample");
                        let _ = monitor.event_tx.send(usage);
                    }
                }
            }
        })
    }
}
