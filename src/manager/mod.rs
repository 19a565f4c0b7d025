//! Driver-owning manager modules.
//!
//! Managers sit between the driver layer and the rest of the system:
//! they own driver instances created from configuration, poll or command
//! them on the tick, and translate results into Shared State keys and
//! bus events.

pub mod actuator;
pub mod sensor;
