//! Module trait, lifecycle states, and the runtime handle bundle.
//!
//! A module is a unit of functionality that participates in the tick
//! loop and the lifecycle. Managers (sensor, actuator) are modules that
//! own driver collections; the system monitor is a module that owns
//! nothing but a timer.
//!
//! ```text
//! CREATED ──configure()──▶ CONFIGURED ──init()──▶ INITIALIZED ──start()──▶ RUNNING
//!                                                                    │
//!                                                       stop()  ◀────┘
//!                                                         │
//!                                                         ▼
//!                                                      STOPPED
//! any state ──error──▶ ERROR ──(reset / restart policy)──▶ INITIALIZED
//! ```

pub mod lifecycle;
pub mod manifest;
pub mod registry;

use serde_json::Value;
use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::ConfigStore;
use crate::error::Result;
use crate::hal::Hal;
use crate::scheduler::SchedulerStats;
use crate::state::SharedState;

/// Shared core handles passed to module factories at instantiation.
#[derive(Clone)]
pub struct Runtime {
    pub state: Arc<SharedState>,
    pub bus: Arc<EventBus>,
    pub config: Arc<ConfigStore>,
    pub hal: Arc<dyn Hal>,
    pub scheduler_stats: Arc<SchedulerStats>,
}

/// Module class, in update order. Also selects the heartbeat timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ModuleType {
    Critical = 0,
    High = 1,
    Standard = 2,
    Low = 3,
    Background = 4,
}

impl ModuleType {
    /// Default liveness threshold for the heartbeat monitor.
    pub fn heartbeat_timeout_ms(self) -> u64 {
        match self {
            Self::Critical => 2_000,
            Self::High => 5_000,
            Self::Standard => 10_000,
            Self::Low => 30_000,
            Self::Background => 60_000,
        }
    }
}

/// Lifecycle state of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Created,
    Configured,
    Initialized,
    Running,
    Error,
    Stopped,
}

/// A unit of functionality driven by the scheduler.
///
/// Lifecycle calls arrive in the order shown in the module chart above;
/// `update()` only runs while the module is RUNNING. Errors from
/// `configure`/`init` leave the module in ERROR and exclude it from the
/// scheduler's active set — other modules continue.
pub trait Module: Send {
    fn name(&self) -> &'static str;

    /// Apply the module's configuration section.
    fn configure(&mut self, config: &Value) -> Result<()>;

    /// Acquire resources; runs after every dependency has initialized.
    fn init(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// One cooperative slice of work. Must return well inside the
    /// manifest's `max_update_us`; long waits are split across ticks.
    fn update(&mut self) -> Result<()>;

    /// Release resources. Must complete in bounded time.
    fn stop(&mut self) -> Result<()>;

    fn is_healthy(&self) -> bool {
        true
    }

    /// 0–100 health indication for diagnostics surfaces.
    fn health_score(&self) -> u8 {
        if self.is_healthy() { 100 } else { 0 }
    }
}
