//! Machine status snapshot and safety flags.
//!
//! A [`MachineStatusSnapshot`] is built fresh by every poll cycle and is never
//! mutated after publication. Consumers hold it behind an `Arc` and always see
//! a consistent point-in-time view.

use crate::axis::{AxisId, AxisState};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

bitflags! {
    /// Safety chain inputs.
    ///
    /// CRITICAL flags (→ block all motion): EMERGENCY_STOP, THERMAL_MAIN_MOTOR,
    /// THERMAL_PUMP_MOTOR, PHASE_SEQUENCE. ALARM is informational.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SafetyFlags: u8 {
        /// Emergency stop engaged. **CRITICAL**.
        const EMERGENCY_STOP     = 0x01;
        /// Main motor thermal relay tripped. **CRITICAL**.
        const THERMAL_MAIN_MOTOR = 0x02;
        /// Pump motor thermal relay tripped. **CRITICAL**.
        const THERMAL_PUMP_MOTOR = 0x04;
        /// Mains phase sequence wrong. **CRITICAL**.
        const PHASE_SEQUENCE     = 0x08;
        /// Machine alarm output active.
        const ALARM              = 0x10;
    }
}

impl SafetyFlags {
    /// Mask of all flags that forbid new motion.
    pub const CRITICAL_MASK: Self = Self::from_bits_truncate(
        Self::EMERGENCY_STOP.bits()
            | Self::THERMAL_MAIN_MOTOR.bits()
            | Self::THERMAL_PUMP_MOTOR.bits()
            | Self::PHASE_SEQUENCE.bits(),
    );

    /// Returns true if any CRITICAL flag is set.
    #[inline]
    pub const fn blocks_motion(&self) -> bool {
        self.intersects(Self::CRITICAL_MASK)
    }

    /// Only the CRITICAL subset.
    #[inline]
    pub const fn critical(&self) -> Self {
        self.intersection(Self::CRITICAL_MASK)
    }
}

impl Default for SafetyFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for SafetyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/// Fieldbus connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Process sensor readings keyed by configured name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorReadings {
    /// [bar]
    pub pressures: BTreeMap<String, f64>,
    /// [°C]
    pub temperatures: BTreeMap<String, f64>,
    /// [%RH]
    pub humidity: BTreeMap<String, f64>,
    /// [l/min]
    pub flow_rates: BTreeMap<String, f64>,
    /// Encoder-measured distances [mm].
    pub distances: BTreeMap<String, f64>,
    pub pollution: BTreeMap<String, bool>,
    pub part_presence: BTreeMap<String, bool>,
}

/// Read-only aggregate of the whole machine at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineStatusSnapshot {
    /// Monotonic publication counter (0 = never polled).
    pub sequence: u64,
    /// Wall-clock time of acquisition [µs since the Unix epoch].
    pub timestamp_us: u64,
    pub axes: Vec<AxisState>,
    pub safety: SafetyFlags,
    /// Motor run flags by name.
    pub motors: BTreeMap<String, bool>,
    /// Valve open flags by name.
    pub valves: BTreeMap<String, bool>,
    pub sensors: SensorReadings,
    pub connection: ConnectionState,
}

impl MachineStatusSnapshot {
    pub fn axis(&self, id: AxisId) -> Option<&AxisState> {
        self.axes.iter().find(|axis| axis.id == id)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// True if any axis reports motion.
    pub fn any_moving(&self) -> bool {
        self.axes.iter().any(|axis| axis.is_moving)
    }
}
