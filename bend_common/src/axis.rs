//! Axis identifiers, calibration and runtime state.
//!
//! - `AxisId` - Closed set of actuated axes on the bender
//! - `AxisCalibration` - Immutable per-axis configuration (`[[axes]]` in machine.toml)
//! - `RulerMode` - How the position sensor reading maps to millimetres
//! - `Actuation` - Voltage-driven proportional valve vs. on/off coil pair
//! - `AxisState` - Mutable per-axis state published in every status snapshot

use crate::config::ConfigError;
use crate::consts::DEFAULT_REGISTER_COUNT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Identifiers ────────────────────────────────────────────────────

/// Every actuated degree of freedom on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisId {
    LeftPiston,
    RightPiston,
    CenterPiston,
    LeftClamp,
    RightClamp,
    Rotation,
}

impl AxisId {
    /// All axes, in status-report order.
    pub const ALL: [AxisId; 6] = [
        AxisId::LeftPiston,
        AxisId::RightPiston,
        AxisId::CenterPiston,
        AxisId::LeftClamp,
        AxisId::RightClamp,
        AxisId::Rotation,
    ];

    /// Canonical snake_case name (matches the TOML spelling).
    pub const fn as_str(self) -> &'static str {
        match self {
            AxisId::LeftPiston => "left_piston",
            AxisId::RightPiston => "right_piston",
            AxisId::CenterPiston => "center_piston",
            AxisId::LeftClamp => "left_clamp",
            AxisId::RightClamp => "right_clamp",
            AxisId::Rotation => "rotation",
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known axis.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown axis identifier: {0}")]
pub struct UnknownAxis(pub String);

impl FromStr for AxisId {
    type Err = UnknownAxis;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AxisId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownAxis(s.to_string()))
    }
}

// ─── Sensor decoding ────────────────────────────────────────────────

/// Position sensor decoding strategy, fixed per axis at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RulerMode {
    /// 4–20 mA over `[0, register_count]`, scaled by the stroke.
    #[default]
    LinearAbsolute,
    /// Sensor only spans `[min_register, max_register]`.
    BoundedRange { min_register: u16, max_register: u16 },
    /// Absolute position from `|raw|`, relative to a movable zero; sign follows raw.
    SignedRelative,
}

impl RulerMode {
    /// Short name used in logs and errors.
    pub const fn name(&self) -> &'static str {
        match self {
            RulerMode::LinearAbsolute => "linear_absolute",
            RulerMode::BoundedRange { .. } => "bounded_range",
            RulerMode::SignedRelative => "signed_relative",
        }
    }

    /// Whether the ruler register carries a two's-complement value.
    #[inline]
    pub const fn is_signed(&self) -> bool {
        matches!(self, RulerMode::SignedRelative)
    }
}

// ─── Actuation ──────────────────────────────────────────────────────

/// How the axis is driven. Exactly one variant applies per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actuation {
    /// Proportional valve commanded through a ±10 V analog output register.
    Voltage {
        /// Holding register of the analog output.
        register: u16,
        /// Coil opening the valve block, when the axis has one.
        #[serde(default)]
        valve_coil: Option<u16>,
    },
    /// Bang-bang valve with one coil per direction.
    Coil { forward_coil: u16, backward_coil: u16 },
}

impl Actuation {
    #[inline]
    pub const fn is_voltage_controlled(&self) -> bool {
        matches!(self, Actuation::Voltage { .. })
    }

    #[inline]
    pub const fn is_coil_controlled(&self) -> bool {
        matches!(self, Actuation::Coil { .. })
    }
}

// ─── Calibration ────────────────────────────────────────────────────

fn default_register_count() -> u32 {
    DEFAULT_REGISTER_COUNT
}

fn default_tolerance() -> f64 {
    0.5
}

/// Immutable per-axis calibration.
///
/// # TOML Example
///
/// ```toml
/// [[axes]]
/// id = "left_piston"
/// stroke_length_mm = 300.0
/// position_tolerance_mm = 0.5
/// ruler_register = 10
/// ruler = { mode = "bounded_range", min_register = 210, max_register = 3890 }
/// actuation = { kind = "voltage", register = 20, valve_coil = 4 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisCalibration {
    /// Which axis this calibration belongs to.
    pub id: AxisId,

    /// Full sensor stroke [mm] (degrees for the rotation axis).
    pub stroke_length_mm: f64,

    /// Sensor resolution (raw counts at full scale).
    #[serde(default = "default_register_count")]
    pub register_count: u32,

    /// Arrival window around the target [mm].
    #[serde(default = "default_tolerance")]
    pub position_tolerance_mm: f64,

    /// Lower travel limit [mm]. Defaults to 0.
    #[serde(default)]
    pub min_position_mm: Option<f64>,

    /// Upper travel limit [mm]. Defaults to the stroke length.
    #[serde(default)]
    pub max_position_mm: Option<f64>,

    /// Initial zero point for signed-relative axes [mm].
    #[serde(default)]
    pub reference_position_mm: f64,

    /// Input register carrying the position sensor.
    pub ruler_register: u16,

    /// Sensor decoding strategy.
    #[serde(default)]
    pub ruler: RulerMode,

    /// Drive wiring.
    pub actuation: Actuation,
}

impl AxisCalibration {
    /// Minimal voltage-driven, linear-ruler calibration.
    pub fn linear(id: AxisId, stroke_length_mm: f64, ruler_register: u16, output_register: u16) -> Self {
        Self {
            id,
            stroke_length_mm,
            register_count: DEFAULT_REGISTER_COUNT,
            position_tolerance_mm: default_tolerance(),
            min_position_mm: None,
            max_position_mm: None,
            reference_position_mm: 0.0,
            ruler_register,
            ruler: RulerMode::LinearAbsolute,
            actuation: Actuation::Voltage {
                register: output_register,
                valve_coil: None,
            },
        }
    }

    /// Effective lower travel limit [mm].
    #[inline]
    pub fn min_position(&self) -> f64 {
        match self.ruler {
            RulerMode::SignedRelative => -self.stroke_length_mm,
            _ => self.min_position_mm.unwrap_or(0.0),
        }
    }

    /// Effective upper travel limit [mm].
    #[inline]
    pub fn max_position(&self) -> f64 {
        match self.ruler {
            RulerMode::SignedRelative => self.stroke_length_mm,
            _ => self.max_position_mm.unwrap_or(self.stroke_length_mm),
        }
    }

    /// Validate the calibration.
    ///
    /// # Validation Rules
    /// 1. `stroke_length_mm` > 0
    /// 2. `register_count` > 0
    /// 3. `position_tolerance_mm` ≥ 0
    /// 4. `min_register` < `max_register` ≤ `register_count` (bounded mode)
    /// 5. `min_position` < `max_position`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let axis = self.id;
        if !(self.stroke_length_mm > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "{axis}: stroke_length_mm must be > 0, got {}",
                self.stroke_length_mm
            )));
        }
        if self.register_count == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{axis}: register_count must be > 0"
            )));
        }
        if !(self.position_tolerance_mm >= 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "{axis}: position_tolerance_mm must be >= 0, got {}",
                self.position_tolerance_mm
            )));
        }
        if let RulerMode::BoundedRange {
            min_register,
            max_register,
        } = self.ruler
        {
            if min_register >= max_register {
                return Err(ConfigError::ValidationError(format!(
                    "{axis}: min_register ({min_register}) must be < max_register ({max_register})"
                )));
            }
            if max_register as u32 > self.register_count {
                return Err(ConfigError::ValidationError(format!(
                    "{axis}: max_register ({max_register}) exceeds register_count ({})",
                    self.register_count
                )));
            }
        }
        if self.min_position() >= self.max_position() {
            return Err(ConfigError::ValidationError(format!(
                "{axis}: min position ({}) must be < max position ({})",
                self.min_position(),
                self.max_position()
            )));
        }
        Ok(())
    }
}

// ─── Runtime state ──────────────────────────────────────────────────

/// Direction of travel. Forward extends the axis (position increases).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// Direction that reduces `remaining = target - current`.
    #[inline]
    pub fn toward(remaining: f64) -> Self {
        if remaining >= 0.0 {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    /// Sign of the command voltage for this direction (negative drives forward).
    #[inline]
    pub const fn voltage_sign(self) -> f64 {
        match self {
            Direction::Forward => -1.0,
            Direction::Backward => 1.0,
        }
    }
}

/// Observed or commanded valve state of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Motion {
    #[default]
    Closed,
    Forward,
    Backward,
}

impl From<Direction> for Motion {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => Motion::Forward,
            Direction::Backward => Motion::Backward,
        }
    }
}

/// Mutable per-axis state. One copy per axis lives in the machine and is
/// cloned into every status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisState {
    pub id: AxisId,
    /// Last sensed position [mm].
    pub current_position_mm: f64,
    /// Target of the current or last move [mm].
    pub target_position_mm: f64,
    /// Last commanded voltage (0 for coil-driven axes).
    pub current_voltage: f64,
    /// Estimated speed from the last two polls [mm/s].
    pub speed_mmps: f64,
    /// Raw sensor register behind `current_position_mm`.
    pub raw_register: i32,
    pub motion: Motion,
    pub is_moving: bool,
    pub is_at_target: bool,
}

impl AxisState {
    pub fn new(id: AxisId) -> Self {
        Self {
            id,
            current_position_mm: 0.0,
            target_position_mm: 0.0,
            current_voltage: 0.0,
            speed_mmps: 0.0,
            raw_register: 0,
            motion: Motion::Closed,
            is_moving: false,
            is_at_target: false,
        }
    }
}
