//! Monotonic millisecond clock.
//!
//! All timestamps in the core (state entries, events, protection timers,
//! heartbeat observations) come from [`now_ms`], counted from process
//! start. Never use wall-clock time for these: wall clocks jump on NTP
//! sync and RTC writes.
//!
//! ## Dual-target design
//!
//! On hardware this maps to the platform tick counter. On host, a
//! simulated clock can be switched in so tests exercise protection
//! windows and poll intervals without real sleeps. [`sim_lock`] hands out
//! the simulated clock under a process-wide mutex — the test harness runs
//! tests in parallel and the clock is a global.

use parking_lot::{Mutex, MutexGuard};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();
static SIM_ENABLED: AtomicBool = AtomicBool::new(false);
static SIM_NOW_MS: AtomicU64 = AtomicU64::new(0);
static SIM_LOCK: Mutex<()> = Mutex::new(());

/// Milliseconds since process start (or since the simulated clock's zero).
pub fn now_ms() -> u64 {
    if SIM_ENABLED.load(Ordering::Relaxed) {
        return SIM_NOW_MS.load(Ordering::Relaxed);
    }
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// Advance the simulated clock. No-op when simulation is off.
pub fn sim_advance_ms(delta: u64) {
    SIM_NOW_MS.fetch_add(delta, Ordering::Relaxed);
}

/// Set the simulated clock to an absolute value.
pub fn sim_set_ms(now: u64) {
    SIM_NOW_MS.store(now, Ordering::Relaxed);
}

/// Acquire the simulated clock, reset to 0 ms.
///
/// The returned guard holds a process-wide lock (one simulated-time test
/// at a time) and restores the real clock when dropped.
pub fn sim_lock() -> SimClock {
    let guard = SIM_LOCK.lock();
    SIM_NOW_MS.store(0, Ordering::Relaxed);
    SIM_ENABLED.store(true, Ordering::Relaxed);
    SimClock { _guard: guard }
}

/// Exclusive handle on the simulated clock. See [`sim_lock`].
pub struct SimClock {
    _guard: MutexGuard<'static, ()>,
}

impl SimClock {
    /// Advance the simulated clock.
    pub fn advance_ms(&self, delta: u64) {
        sim_advance_ms(delta);
    }

    /// Set the simulated clock to an absolute value.
    pub fn set_ms(&self, now: u64) {
        sim_set_ms(now);
    }
}

impl Drop for SimClock {
    fn drop(&mut self) {
        SIM_ENABLED.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_advances_only_when_told() {
        let clock = sim_lock();
        assert_eq!(now_ms(), 0);
        clock.advance_ms(250);
        assert_eq!(now_ms(), 250);
        clock.set_ms(10_000);
        assert_eq!(now_ms(), 10_000);
    }

    #[test]
    fn real_clock_is_monotonic() {
        // Serialize with any simulated-clock test.
        let _lock = SIM_LOCK.lock();
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
