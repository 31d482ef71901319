//! System-wide constants for the bender workspace.
//!
//! Single source of truth for the electrical ranges of the I/O rack and the
//! default cadences. Imported by all crates; never duplicated.

use static_assertions::const_assert;

// ─── Analog output (command voltage) ───────────────────────────────

/// Lowest command voltage accepted by the proportional valve amplifiers.
pub const VOLTAGE_MIN: f64 = -10.0;

/// Highest command voltage accepted by the proportional valve amplifiers.
pub const VOLTAGE_MAX: f64 = 10.0;

/// Lowest two's-complement value of a 12-bit analog output register.
pub const VOLTAGE_REGISTER_MIN: i32 = -2048;

/// Highest two's-complement value of a 12-bit analog output register.
pub const VOLTAGE_REGISTER_MAX: i32 = 2047;

/// Register counts per volt (symmetric scale, 0 V ↔ register 0).
pub const REGISTERS_PER_VOLT: f64 = 2048.0 / VOLTAGE_MAX;

/// Below this magnitude a command voltage is treated as "no motion".
pub const MOTION_DEADBAND_V: f64 = 0.1;

// ─── Analog input (current loop) ───────────────────────────────────

/// Current-loop floor; also the "no signal" value.
pub const CURRENT_MIN_MA: f64 = 4.0;

/// Current-loop ceiling.
pub const CURRENT_MAX_MA: f64 = 20.0;

/// Resolution of a 12-bit analog input card.
pub const DEFAULT_REGISTER_COUNT: u32 = 4095;

// ─── Fieldbus ───────────────────────────────────────────────────────

/// Standard Modbus-TCP port.
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Capacity of the broadcast channels carrying fieldbus and machine events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ─── Status synchronization ─────────────────────────────────────────

/// Default status poll period in milliseconds.
pub const DEFAULT_SYNC_PERIOD_MS: u64 = 100;

/// Default wait bound for the single-slot poll gate in milliseconds.
pub const DEFAULT_GATE_WAIT_MS: u64 = 50;

/// Default connection check interval while disconnected in milliseconds.
pub const DEFAULT_RECONNECT_POLL_MS: u64 = 1000;

/// Number of cycle durations kept for the rolling average.
pub const DEFAULT_DURATION_WINDOW: usize = 1000;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bender/machine.toml";

const_assert!(VOLTAGE_REGISTER_MIN < VOLTAGE_REGISTER_MAX);
const_assert!(DEFAULT_GATE_WAIT_MS < DEFAULT_SYNC_PERIOD_MS);
const_assert!(DEFAULT_SYNC_PERIOD_MS < DEFAULT_RECONNECT_POLL_MS);
