//! Axis physics simulator.
//!
//! The `AxisSimulator` moves one ruler register in response to the outputs
//! found in the register bank:
//! - Voltage: proportional valve, speed ∝ command voltage (negative = forward)
//! - Coil: bang-bang valve, constant speed while exactly one coil is set
//!
//! Positions are tracked in raw sensor counts so the control side sees the
//! same quantization as on the real rack.

use super::super::bank::RegisterBank;
use bend_common::axis::{Actuation, AxisCalibration, AxisId, RulerMode};
use bend_common::consts::MOTION_DEADBAND_V;
use bend_common::convert::register_to_voltage;
use tracing::trace;

/// Axis simulator providing physics-based motion simulation.
#[derive(Debug, Clone)]
pub struct AxisSimulator {
    /// Axis calibration (sensor range, actuation wiring)
    calibration: AxisCalibration,
    /// Sensor reading in counts (fractional, published rounded)
    raw: f64,
    /// Velocity of the last step in counts/second
    velocity: f64,
    /// Proportional valve gain
    counts_per_volt_second: f64,
    /// Bang-bang valve speed
    coil_counts_per_second: f64,
    /// Stuck sensor / stalled actuator
    frozen: bool,
}

impl AxisSimulator {
    /// Default proportional gain: full scale in ~2.7 s at 10 V.
    pub const DEFAULT_COUNTS_PER_VOLT_SECOND: f64 = 150.0;

    /// Default coil-driven speed.
    pub const DEFAULT_COIL_COUNTS_PER_SECOND: f64 = 600.0;

    /// Create a simulator parked at the sensor's low end.
    pub fn new(calibration: AxisCalibration) -> Self {
        let raw = match calibration.ruler {
            RulerMode::BoundedRange { min_register, .. } => min_register as f64,
            _ => 0.0,
        };
        Self {
            calibration,
            raw,
            velocity: 0.0,
            counts_per_volt_second: Self::DEFAULT_COUNTS_PER_VOLT_SECOND,
            coil_counts_per_second: Self::DEFAULT_COIL_COUNTS_PER_SECOND,
            frozen: false,
        }
    }

    #[inline]
    pub fn id(&self) -> AxisId {
        self.calibration.id
    }

    /// Current sensor reading, as published.
    #[inline]
    pub fn raw(&self) -> i32 {
        self.raw.round() as i32
    }

    /// Velocity of the last step [counts/s].
    #[inline]
    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    pub fn set_gain(&mut self, counts_per_volt_second: f64) {
        self.counts_per_volt_second = counts_per_volt_second;
    }

    pub fn set_coil_speed(&mut self, counts_per_second: f64) {
        self.coil_counts_per_second = counts_per_second;
    }

    /// Teleport the sensor reading (clamped to the physical range).
    pub fn set_raw(&mut self, raw: i32, bank: &mut RegisterBank) {
        let (lo, hi) = self.raw_limits();
        self.raw = (raw as f64).clamp(lo, hi);
        self.publish(bank);
    }

    /// Advance the axis by `dt_s` seconds under the outputs currently in `bank`.
    pub fn step(&mut self, bank: &mut RegisterBank, dt_s: f64) {
        self.velocity = if self.frozen {
            0.0
        } else {
            self.commanded_velocity(bank)
        };

        if self.velocity != 0.0 && dt_s > 0.0 {
            let (lo, hi) = self.raw_limits();
            self.raw = (self.raw + self.velocity * dt_s).clamp(lo, hi);
            trace!(axis = %self.id(), raw = self.raw, velocity = self.velocity, "axis step");
        }
        self.publish(bank);
    }

    /// Write the rounded reading into the ruler input register.
    pub fn publish(&self, bank: &mut RegisterBank) {
        let raw = self.raw();
        let word = if self.calibration.ruler.is_signed() {
            (raw.clamp(i16::MIN as i32, i16::MAX as i32) as i16) as u16
        } else {
            raw.clamp(0, u16::MAX as i32) as u16
        };
        bank.set_input(self.calibration.ruler_register, word);
    }

    fn commanded_velocity(&self, bank: &RegisterBank) -> f64 {
        match self.calibration.actuation {
            Actuation::Voltage {
                register,
                valve_coil,
            } => {
                if valve_coil.is_some_and(|coil| !bank.coil(coil)) {
                    return 0.0;
                }
                let voltage = register_to_voltage(bank.holding(register) as i16 as i32);
                if voltage.abs() < MOTION_DEADBAND_V {
                    return 0.0;
                }
                -voltage * self.counts_per_volt_second
            }
            Actuation::Coil {
                forward_coil,
                backward_coil,
            } => match (bank.coil(forward_coil), bank.coil(backward_coil)) {
                (true, false) => self.coil_counts_per_second,
                (false, true) => -self.coil_counts_per_second,
                _ => 0.0,
            },
        }
    }

    fn raw_limits(&self) -> (f64, f64) {
        let count = self.calibration.register_count as f64;
        match self.calibration.ruler {
            RulerMode::LinearAbsolute => (0.0, count),
            RulerMode::BoundedRange {
                min_register,
                max_register,
            } => (min_register as f64, max_register as f64),
            RulerMode::SignedRelative => (-count, count),
        }
    }
}
