//! Heartbeat monitor: per-module liveness tracking and restart policy.
//!
//! The scheduler feeds an observation each time a module's `update()`
//! returns normally. Each tick the application asks `check()` for stale
//! modules; the configured recovery policy decides between warning,
//! restarting (stop → init → start), or escalating to a full stop.
//! Restarts are counted and capped — past the cap the monitor escalates
//! regardless of policy.
//!
//! Observations may arrive from any context, so the table sits behind
//! its own mutex: updates take an unbounded lock (correctness-critical),
//! read-only queries use a bounded wait and report `Timeout` instead of
//! stalling the caller.

use log::{error, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::module::ModuleType;
use crate::time;

/// Bounded wait for non-critical queries.
const QUERY_LOCK_TIMEOUT: Duration = Duration::from_millis(5);

/// What to do with an unresponsive module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Emit a health warning only.
    Warn,
    /// Attempt stop → init → start.
    Restart,
    /// Stop the whole application.
    Escalate,
}

/// Verdict for one stale module, produced by [`HeartbeatMonitor::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    Warn { name: String, age_ms: u64 },
    Restart { name: String, age_ms: u64 },
    Escalate { name: String, age_ms: u64 },
}

struct Liveness {
    module_type: ModuleType,
    timeout_ms: u64,
    last_seen_ms: u64,
    restarts: u32,
}

/// The liveness table.
pub struct HeartbeatMonitor {
    table: Mutex<HashMap<String, Liveness>>,
    policy: RecoveryPolicy,
    restart_cap: u32,
    enabled: std::sync::atomic::AtomicBool,
}

impl HeartbeatMonitor {
    pub fn new(policy: RecoveryPolicy, restart_cap: u32) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            policy,
            restart_cap,
            enabled: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    pub fn restart_cap(&self) -> u32 {
        self.restart_cap
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Track `name` with its type's default timeout.
    pub fn register(&self, name: &str, module_type: ModuleType) {
        self.table.lock().insert(
            name.to_string(),
            Liveness {
                module_type,
                timeout_ms: module_type.heartbeat_timeout_ms(),
                last_seen_ms: time::now_ms(),
                restarts: 0,
            },
        );
    }

    /// Override the timeout for one module.
    pub fn set_timeout(&self, name: &str, timeout_ms: u64) {
        if let Some(entry) = self.table.lock().get_mut(name) {
            entry.timeout_ms = timeout_ms.max(1);
        }
    }

    pub fn unregister(&self, name: &str) {
        self.table.lock().remove(name);
    }

    /// Record a successful update. Unbounded lock: losing an observation
    /// would fake a timeout.
    pub fn observe(&self, name: &str) {
        if let Some(entry) = self.table.lock().get_mut(name) {
            entry.last_seen_ms = time::now_ms();
        }
    }

    /// Walk the table and produce an action per stale module. A module
    /// already at the restart cap escalates regardless of policy.
    pub fn check(&self) -> Vec<RecoveryAction> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let now = time::now_ms();
        let mut actions = Vec::new();
        let mut table = self.table.lock();
        for (name, entry) in table.iter_mut() {
            let age_ms = now.saturating_sub(entry.last_seen_ms);
            if age_ms <= entry.timeout_ms {
                continue;
            }
            warn!(
                "heartbeat: module '{name}' ({:?}) silent for {age_ms} ms (limit {} ms)",
                entry.module_type, entry.timeout_ms
            );
            let action = if entry.restarts >= self.restart_cap {
                error!(
                    "heartbeat: module '{name}' exceeded restart cap ({}), escalating",
                    self.restart_cap
                );
                RecoveryAction::Escalate {
                    name: name.clone(),
                    age_ms,
                }
            } else {
                match self.policy {
                    RecoveryPolicy::Warn => RecoveryAction::Warn {
                        name: name.clone(),
                        age_ms,
                    },
                    RecoveryPolicy::Restart => {
                        entry.restarts += 1;
                        // Give the restarted module a fresh window.
                        entry.last_seen_ms = now;
                        RecoveryAction::Restart {
                            name: name.clone(),
                            age_ms,
                        }
                    }
                    RecoveryPolicy::Escalate => RecoveryAction::Escalate {
                        name: name.clone(),
                        age_ms,
                    },
                }
            };
            actions.push(action);
        }
        actions
    }

    /// Restarts attempted for `name` so far.
    pub fn restart_count(&self, name: &str) -> u32 {
        self.table.lock().get(name).map_or(0, |e| e.restarts)
    }

    /// Non-critical query: `(name, age_ms)` per module. Bounded wait;
    /// `Timeout` if the table is contended.
    pub fn snapshot(&self) -> Result<Vec<(String, u64)>> {
        let table = self
            .table
            .try_lock_for(QUERY_LOCK_TIMEOUT)
            .ok_or_else(|| Error::timeout("heartbeat table busy"))?;
        let now = time::now_ms();
        Ok(table
            .iter()
            .map(|(name, e)| (name.clone(), now.saturating_sub(e.last_seen_ms)))
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_modules_are_quiet() {
        let _clock = time::sim_lock();
        let monitor = HeartbeatMonitor::new(RecoveryPolicy::Warn, 3);
        monitor.register("m", ModuleType::Critical);
        assert!(monitor.check().is_empty());
    }

    #[test]
    fn stale_module_triggers_policy_action() {
        let clock = time::sim_lock();
        let monitor = HeartbeatMonitor::new(RecoveryPolicy::Warn, 3);
        monitor.register("m", ModuleType::Critical); // 2 s timeout
        clock.advance_ms(2500);
        let actions = monitor.check();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], RecoveryAction::Warn { name, .. } if name == "m"));
    }

    #[test]
    fn observation_resets_the_window() {
        let clock = time::sim_lock();
        let monitor = HeartbeatMonitor::new(RecoveryPolicy::Warn, 3);
        monitor.register("m", ModuleType::Critical);
        clock.advance_ms(1500);
        monitor.observe("m");
        clock.advance_ms(1500);
        assert!(monitor.check().is_empty());
    }

    #[test]
    fn restart_policy_counts_and_escalates_at_cap() {
        let clock = time::sim_lock();
        let monitor = HeartbeatMonitor::new(RecoveryPolicy::Restart, 2);
        monitor.register("m", ModuleType::Critical);

        for expected in 1..=2u32 {
            clock.advance_ms(2500);
            let actions = monitor.check();
            assert!(matches!(actions[0], RecoveryAction::Restart { .. }));
            assert_eq!(monitor.restart_count("m"), expected);
        }

        // Cap reached: further staleness escalates.
        clock.advance_ms(2500);
        let actions = monitor.check();
        assert!(matches!(actions[0], RecoveryAction::Escalate { .. }));
        assert_eq!(monitor.restart_count("m"), 2);
    }

    #[test]
    fn per_type_timeouts_differ() {
        let clock = time::sim_lock();
        let monitor = HeartbeatMonitor::new(RecoveryPolicy::Warn, 3);
        monitor.register("crit", ModuleType::Critical); // 2 s
        monitor.register("bg", ModuleType::Background); // 60 s
        clock.advance_ms(5000);
        let actions = monitor.check();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], RecoveryAction::Warn { name, .. } if name == "crit"));
    }

    #[test]
    fn timeout_override_applies() {
        let clock = time::sim_lock();
        let monitor = HeartbeatMonitor::new(RecoveryPolicy::Warn, 3);
        monitor.register("bg", ModuleType::Background);
        monitor.set_timeout("bg", 100);
        clock.advance_ms(200);
        assert_eq!(monitor.check().len(), 1);
    }

    #[test]
    fn disabled_monitor_reports_nothing() {
        let clock = time::sim_lock();
        let monitor = HeartbeatMonitor::new(RecoveryPolicy::Escalate, 3);
        monitor.register("m", ModuleType::Critical);
        monitor.set_enabled(false);
        clock.advance_ms(10_000);
        assert!(monitor.check().is_empty());
        monitor.set_enabled(true);
        assert_eq!(monitor.check().len(), 1);
    }

    #[test]
    fn snapshot_reports_ages() {
        let clock = time::sim_lock();
        let monitor = HeartbeatMonitor::new(RecoveryPolicy::Warn, 3);
        monitor.register("m", ModuleType::Standard);
        clock.advance_ms(1234);
        let snapshot = monitor.snapshot().unwrap();
        assert_eq!(snapshot, vec![("m".to_string(), 1234)]);
    }
}
