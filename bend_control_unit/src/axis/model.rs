//! Axis position model.
//!
//! Translates between the sensor/register domain and millimetres for one
//! axis. No I/O happens here; `AxisDrive` and the status reader feed it raw
//! values read from the fieldbus.
//!
//! ## Ruler decoding
//!
//! | Mode            | raw → position                                              |
//! |-----------------|-------------------------------------------------------------|
//! | LinearAbsolute  | 4–20 mA over `[0, register_count]`, × stroke                |
//! | BoundedRange    | raw clamped to `[min_register, max_register]`, × stroke     |
//! | SignedRelative  | sign(raw) × (linear(\|raw\|) − reference), ±stroke          |
//!
//! Every position is rounded to 0.01 mm and clamped to the axis travel
//! range (`[−stroke, +stroke]` in signed mode).

use crate::error::ControlError;
use bend_common::axis::{AxisCalibration, AxisId, Direction, Motion, RulerMode};
use bend_common::consts::{MOTION_DEADBAND_V, VOLTAGE_MAX};
use bend_common::convert::{
    millimeters_to_register, register_to_millimeters, register_to_voltage, round_to,
    voltage_to_register,
};
use std::sync::Arc;

/// Position model of one axis.
///
/// The calibration is immutable and shared; only the signed-mode reference
/// can change at runtime (`set_reference`).
#[derive(Debug, Clone)]
pub struct AxisPositionModel {
    calibration: Arc<AxisCalibration>,
    /// Absolute position of the signed-mode zero [mm]
    reference_mm: f64,
}

impl AxisPositionModel {
    pub fn new(calibration: Arc<AxisCalibration>) -> Self {
        let reference_mm = calibration.reference_position_mm;
        Self {
            calibration,
            reference_mm,
        }
    }

    #[inline]
    pub fn id(&self) -> AxisId {
        self.calibration.id
    }

    #[inline]
    pub fn calibration(&self) -> &Arc<AxisCalibration> {
        &self.calibration
    }

    #[inline]
    pub fn reference_mm(&self) -> f64 {
        self.reference_mm
    }

    #[inline]
    pub fn tolerance(&self) -> f64 {
        self.calibration.position_tolerance_mm
    }

    #[inline]
    fn clamp(&self, position: f64) -> f64 {
        position.clamp(
            self.calibration.min_position(),
            self.calibration.max_position(),
        )
    }

    /// Absolute millimetres for `|raw|` over the full register range.
    #[inline]
    fn linear(&self, raw: i64) -> f64 {
        register_to_millimeters(
            raw,
            self.calibration.register_count,
            self.calibration.stroke_length_mm,
        )
    }

    // ─── raw → position ─────────────────────────────────────────────

    /// Decode `raw` with the axis' configured ruler mode.
    pub fn position(&self, raw: i32) -> f64 {
        match self.calibration.ruler {
            RulerMode::LinearAbsolute => self.position_from_ruler(raw),
            RulerMode::BoundedRange {
                min_register,
                max_register,
            } => self.bounded(raw, min_register, max_register),
            RulerMode::SignedRelative => self.position_from_ruler_signed(raw),
        }
    }

    /// Linear 4–20 mA decoding. Readings above `register_count` clamp to full stroke.
    pub fn position_from_ruler(&self, raw: i32) -> f64 {
        self.clamp(self.linear(raw as i64))
    }

    /// Bounded-range decoding; fails on axes without register bounds.
    pub fn position_from_ruler_bounded(&self, raw: i32) -> Result<f64, ControlError> {
        match self.calibration.ruler {
            RulerMode::BoundedRange {
                min_register,
                max_register,
            } => Ok(self.bounded(raw, min_register, max_register)),
            _ => Err(ControlError::RulerModeMismatch {
                axis: self.id(),
                expected: "bounded_range",
            }),
        }
    }

    fn bounded(&self, raw: i32, min_register: u16, max_register: u16) -> f64 {
        let (lo, hi) = (min_register as f64, max_register as f64);
        let span = hi - lo;
        if span <= 0.0 {
            return self.clamp(0.0);
        }
        let fraction = ((raw as f64).clamp(lo, hi) - lo) / span;
        self.clamp(round_to(fraction * self.calibration.stroke_length_mm, 2))
    }

    /// Signed reference-relative decoding.
    pub fn position_from_ruler_signed(&self, raw: i32) -> f64 {
        let magnitude = self.linear((raw as i64).abs()) - self.reference_mm;
        let position = if raw < 0 { -magnitude } else { magnitude };
        let stroke = self.calibration.stroke_length_mm;
        round_to(position, 2).clamp(-stroke, stroke)
    }

    // ─── position → raw ─────────────────────────────────────────────

    /// Sensor reading expected at `position` (inverse of [`Self::position`]).
    pub fn ruler_from_position(&self, position: f64) -> i32 {
        let count = self.calibration.register_count;
        let stroke = self.calibration.stroke_length_mm;
        match self.calibration.ruler {
            RulerMode::LinearAbsolute => millimeters_to_register(position, count, stroke) as i32,
            RulerMode::BoundedRange {
                min_register,
                max_register,
            } => {
                let fraction = if stroke > 0.0 {
                    (position / stroke).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let span = max_register.saturating_sub(min_register) as f64;
                min_register as i32 + (fraction * span).round() as i32
            }
            RulerMode::SignedRelative => {
                let absolute = position.abs() + self.reference_mm;
                let raw = millimeters_to_register(absolute, count, stroke) as i32;
                if position < 0.0 { -raw } else { raw }
            }
        }
    }

    // ─── Command voltage ────────────────────────────────────────────

    #[inline]
    pub fn voltage_to_register(&self, voltage: f64) -> i16 {
        voltage_to_register(voltage)
    }

    #[inline]
    pub fn register_to_voltage(&self, register: i32) -> f64 {
        register_to_voltage(register)
    }

    /// Command voltage for travelling in `direction` at `speed_percent` of full scale.
    pub fn drive_voltage(&self, direction: Direction, speed_percent: f64) -> f64 {
        direction.voltage_sign() * speed_percent.clamp(0.0, 100.0) / 100.0 * VOLTAGE_MAX
    }

    /// Motion implied by an output voltage. Negative drives forward.
    pub fn motion_from_voltage(&self, voltage: f64, valve_open: bool) -> Motion {
        if !valve_open || voltage.is_nan() || voltage.abs() < MOTION_DEADBAND_V {
            Motion::Closed
        } else if voltage < 0.0 {
            Motion::Forward
        } else {
            Motion::Backward
        }
    }

    // ─── Travel limits ──────────────────────────────────────────────

    pub fn can_move_forward(&self, current: f64) -> bool {
        self.calibration.max_position() - current > self.tolerance()
    }

    pub fn can_move_backward(&self, current: f64) -> bool {
        current - self.calibration.min_position() > self.tolerance()
    }

    pub fn can_move(&self, direction: Direction, current: f64) -> bool {
        match direction {
            Direction::Forward => self.can_move_forward(current),
            Direction::Backward => self.can_move_backward(current),
        }
    }

    /// Whether `target` lies inside the travel range (widened by the tolerance).
    pub fn in_range(&self, target: f64) -> bool {
        let tol = self.tolerance();
        target >= self.calibration.min_position() - tol
            && target <= self.calibration.max_position() + tol
    }

    // ─── Reference ──────────────────────────────────────────────────

    /// Make the position at `raw` the new zero. Signed-mode axes only.
    ///
    /// Returns the new reference [mm, absolute].
    pub fn set_reference(&mut self, raw: i32) -> Result<f64, ControlError> {
        if !self.calibration.ruler.is_signed() {
            return Err(ControlError::RulerModeMismatch {
                axis: self.id(),
                expected: "signed_relative",
            });
        }
        self.reference_mm = self.linear((raw as i64).abs());
        Ok(self.reference_mm)
    }
}
