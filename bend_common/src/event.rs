//! Machine-level notifications.
//!
//! Published on a `tokio::sync::broadcast` channel owned by the machine.
//! Slow subscribers lag and lose the oldest events; the latest status is
//! always available separately through the status `watch` channel.

use crate::axis::{AxisId, Motion};
use crate::status::SafetyFlags;
use serde::{Deserialize, Serialize};

/// Phase of one positioning move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovePhase {
    Idle,
    /// Driving at the speed of the given profile stage.
    Seeking { stage: usize },
    /// Final stage, waiting for consecutive in-tolerance samples.
    Approaching,
    Settled,
    Faulted,
}

impl MovePhase {
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, MovePhase::Settled | MovePhase::Faulted)
    }
}

/// Stage transition or terminal state of a move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositioningEvent {
    pub axis: AxisId,
    pub phase: MovePhase,
    pub position_mm: f64,
    /// Share of the initial distance covered so far.
    pub travelled_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MachineEvent {
    /// A new snapshot was published.
    StatusRefreshed { sequence: u64 },
    AxisMotionChanged { axis: AxisId, motion: Motion },
    /// The alarm input was raised.
    AlarmRaised(SafetyFlags),
    /// A blocking safety input was raised; all axes were stopped.
    SafetyViolation(SafetyFlags),
    Positioning(PositioningEvent),
    /// A poll cycle failed; the loop keeps running.
    SyncFault { message: String },
}
