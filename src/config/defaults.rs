//! Embedded factory defaults, one document per recognized section.
//!
//! When a stored section is missing or fails to parse, the default is
//! substituted and the section is marked dirty so the next save restores
//! a readable blob on flash.

use serde_json::{Value, json};

/// Schema version written by this firmware build.
pub const CONFIG_VERSION: u32 = 3;

/// The closed set of recognized sections (manifests enumerate them).
pub const RECOGNIZED_SECTIONS: &[&str] = &[
    "system",
    "sensors",
    "actuators",
    "climate",
    "network",
    "logging",
];

/// Factory default for `section`, or `None` for unrecognized names.
pub fn default_section(section: &str) -> Option<Value> {
    let doc = match section {
        "system" => json!({
            "version": CONFIG_VERSION,
            "tick_period_ms": 10,
            "bus_queue_size": 32,
            "bus_process_budget_ms": 2,
            "heartbeat_enabled": true,
        }),
        "sensors" => json!({
            "poll_interval_ms": 10_000,
            "publish_on_error": false,
            "sensors": [],
        }),
        "actuators" => json!({
            "status_republish_ms": 1000,
            "actuators": [],
        }),
        "climate" => json!({
            "setpoint": 4.0,
            "hysteresis": 0.5,
            "mode": "cool",
            "defrost": {
                "period_min": 360,
                "duration_min": 20,
            },
        }),
        "network" => json!({
            "hostname": "modesp",
            "mqtt_enabled": false,
        }),
        "logging" => json!({
            "level": "info",
        }),
        _ => return None,
    };
    Some(doc)
}
