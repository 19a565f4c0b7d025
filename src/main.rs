//! Host simulator: boots the full runtime against the mock HAL.
//!
//! Seeds a demo configuration (one NTC chamber probe, one compressor
//! relay with protection, one evaporator fan on PWM), runs the real tick
//! loop for a few seconds while nudging the simulated hardware, then
//! shuts down gracefully. Useful for eyeballing log output and state
//! flow without a board.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::info;
use serde_json::json;

use modesp::app::{AppState, Application};
use modesp::config::storage::{FileStorage, SectionStorage};
use modesp::hal::mock::MockHal;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let data_dir = std::env::temp_dir().join("modesp-sim");
    let storage = Arc::new(FileStorage::open(&data_dir).context("open config storage")?);
    seed_demo_config(storage.as_ref()).context("seed demo config")?;

    let hal = Arc::new(MockHal::new());
    hal.set_adc_raw("adc_chamber", 2048); // ~25 C
    hal.set_onewire_temp("ow_evap", -21.0);

    let mut app = Application::new(storage, hal.clone());
    app.boot().context("boot")?;

    // Ask for cooling, then watch the protection timers do their job.
    app.shared_state()
        .set("command.actuator.compressor", true)
        .ok();
    app.shared_state().set("command.actuator.fan", 60.0).ok();

    info!("simulator: running for 3 s");
    app.run_for(Duration::from_secs(1));
    // Chamber warms a little; command the fan harder.
    hal.set_adc_raw("adc_chamber", 2200);
    app.shared_state().set("command.actuator.fan", 85.0).ok();
    app.run_for(Duration::from_secs(2));

    let stats = app.bus().stats();
    info!(
        "bus: {} published, {} processed, {} dropped, avg {:.1} us/event",
        stats.total_published, stats.total_processed, stats.total_dropped, stats.avg_process_us
    );
    let scheduler_stats = app.scheduler().stats();
    info!(
        "scheduler: {} ticks, {} overruns, cpu {:.1}%",
        scheduler_stats.ticks(),
        scheduler_stats.tick_overruns(),
        scheduler_stats.cpu_usage() * 100.0
    );
    info!(
        "chamber: {:?}",
        app.shared_state().get("state.sensor.chamber")
    );

    app.stop();
    anyhow::ensure!(app.state() == AppState::Stopped, "clean shutdown");
    info!("simulator: done");
    Ok(())
}

/// Write the demo section blobs, overwriting any previous run's state.
fn seed_demo_config(storage: &dyn SectionStorage) -> modesp::Result<()> {
    storage.store(
        "system",
        &json!({
            "version": 3,
            "tick_period_ms": 10,
            "bus_queue_size": 64,
            "bus_process_budget_ms": 2,
            "heartbeat_enabled": true,
        })
        .to_string(),
    )?;
    storage.store(
        "sensors",
        &json!({
            "poll_interval_ms": 500,
            "publish_on_error": false,
            "sensors": [
                { "role": "chamber", "type": "ntc",
                  "config": { "adc": "adc_chamber" } },
                { "role": "evaporator", "type": "ds18b20",
                  "config": { "bus": "ow_evap" } },
            ],
        })
        .to_string(),
    )?;
    storage.store(
        "actuators",
        &json!({
            "status_republish_ms": 1000,
            "actuators": [
                { "role": "compressor", "type": "relay",
                  "config": { "pin": "relay_k1", "min_on_time_s": 2, "min_off_time_s": 2 } },
                { "role": "fan", "type": "pwm",
                  "config": { "channel": "fan_pwm", "ramp_time_ms": 800, "min_duty_percent": 10.0 } },
            ],
        })
        .to_string(),
    )?;
    Ok(())
}
