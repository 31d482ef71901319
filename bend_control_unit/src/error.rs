//! Control unit error type.
//!
//! Motion faults (sensor freeze, timeout, drift) are not errors: they are
//! reported as [`crate::positioning::MoveOutcome::Faulted`]. `ControlError`
//! covers requests the control unit refuses or cannot carry out.

use bend_common::axis::{AxisId, Direction, UnknownAxis};
use bend_common::fieldbus::FieldbusError;
use bend_common::status::SafetyFlags;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    /// String did not name any axis.
    #[error("unknown axis: {0}")]
    UnknownAxis(String),

    /// Axis exists but has no calibration on this machine.
    #[error("axis {0} is not configured")]
    AxisNotConfigured(AxisId),

    /// Decoding requested in a mode the axis is not wired for.
    #[error("axis {axis} is not a {expected} axis")]
    RulerModeMismatch { axis: AxisId, expected: &'static str },

    /// A critical safety input forbids motion.
    #[error("motion blocked by safety interlock: {0}")]
    SafetyInterlock(SafetyFlags),

    /// Requested motion would leave the travel range.
    #[error("axis {axis} cannot move {direction:?}: travel limit reached")]
    LimitReached { axis: AxisId, direction: Direction },

    /// Jog speed outside (0, 100] percent.
    #[error("invalid speed: {0}% (expected 0 < speed <= 100)")]
    InvalidSpeed(f64),

    /// Per-move speed profile failed validation.
    #[error("invalid speed profile: {0}")]
    InvalidProfile(String),

    #[error(transparent)]
    Fieldbus(#[from] FieldbusError),
}

impl From<UnknownAxis> for ControlError {
    fn from(err: UnknownAxis) -> Self {
        ControlError::UnknownAxis(err.0)
    }
}
