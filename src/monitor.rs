//! System monitor module.
//!
//! Background module that publishes runtime vitals to Shared State at a
//! fixed cadence — uptime, the scheduler's CPU-usage estimate, and
//! whether heartbeat supervision is on — and emits a `system.heartbeat`
//! event other nodes of the UI/telemetry stack can latch onto.

use serde_json::{Value, json};

use crate::bus::{EventPriority, topics};
use crate::error::Result;
use crate::module::{Module, Runtime};
use crate::state::StateValue;
use crate::time;

const DEFAULT_PERIOD_MS: u64 = 1000;

/// Publisher of `state.system.*` vitals.
pub struct SystemMonitor {
    rt: Runtime,
    period_ms: u64,
    heartbeat_enabled: bool,
    last_publish_ms: u64,
    started_ms: u64,
}

impl SystemMonitor {
    pub const NAME: &'static str = "system_monitor";

    pub fn new(rt: Runtime) -> Self {
        Self {
            rt,
            period_ms: DEFAULT_PERIOD_MS,
            heartbeat_enabled: true,
            last_publish_ms: 0,
            started_ms: 0,
        }
    }

    fn publish_vitals(&self) {
        let now = time::now_ms();
        let uptime_s = now.saturating_sub(self.started_ms) / 1000;
        let cpu_percent = (self.rt.scheduler_stats.cpu_usage() * 100.0).round();

        let state = &self.rt.state;
        state.set("state.system.uptime", uptime_s as i64).ok();
        state.set("state.system.cpu_usage", cpu_percent).ok();
        state
            .set(
                "state.system.heartbeat_enabled",
                StateValue::Bool(self.heartbeat_enabled),
            )
            .ok();

        self.rt
            .bus
            .publish(
                topics::SYSTEM_HEARTBEAT,
                json!({ "uptime_s": uptime_s, "cpu_percent": cpu_percent }),
                EventPriority::Low,
            )
            .ok();
    }
}

impl Module for SystemMonitor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        self.period_ms = config
            .get("monitor_period_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_PERIOD_MS)
            .max(100);
        self.heartbeat_enabled = config
            .get("heartbeat_enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.started_ms = time::now_ms();
        // Vitals are visible from the first tick, not a period later.
        self.last_publish_ms = 0;
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        let now = time::now_ms();
        if self.last_publish_ms != 0 && now.saturating_sub(self.last_publish_ms) < self.period_ms {
            return Ok(());
        }
        self.last_publish_ms = now.max(1);
        self.publish_vitals();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
