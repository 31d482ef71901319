//! Prelude module for common re-exports.
//!
//! ```rust
//! use bend_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, FieldbusConfig, MachineConfig, PositioningConfig, SharedConfig,
    SpeedProfile, SpeedStage, SyncConfig,
};

// ─── Axis model ─────────────────────────────────────────────────────
pub use crate::axis::{
    Actuation, AxisCalibration, AxisId, AxisState, Direction, Motion, RulerMode,
};

// ─── Status and events ──────────────────────────────────────────────
pub use crate::event::{MachineEvent, MovePhase, PositioningEvent};
pub use crate::status::{ConnectionState, MachineStatusSnapshot, SafetyFlags, SensorReadings};

// ─── Fieldbus ───────────────────────────────────────────────────────
pub use crate::fieldbus::{FieldbusError, FieldbusEvent, FieldbusTransport, TransportFactory};
