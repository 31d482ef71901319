//! # Bender Control Unit Library
//!
//! Motion core of the hydraulic profile bender. Converts ruler readings to
//! positions, drives proportional valves and directional coils, closes the
//! positioning loop per axis and keeps a published machine status current.
//!
//! ## Layers
//!
//! 1. **Axis**: position model (pure) and output drive (fieldbus writes)
//! 2. **Positioning**: staged closed-loop controller, one task per move
//! 3. **Status**: raw acquisition and decoding into a snapshot
//! 4. **Sync**: periodic, non-overlapping status loop with reconnection
//! 5. **Machine**: facade offered to the recipe and API layers
//!
//! ## Safety
//!
//! Critical safety inputs block every new motion command, abort running
//! moves and stop all axes on their rising edge. Every failure path releases
//! the outputs of the affected axis.

pub mod axis;
pub mod error;
pub mod machine;
pub mod positioning;
pub mod safety;
pub mod status;
pub mod sync;

pub use crate::axis::{AxisDrive, AxisPositionModel};
pub use crate::error::ControlError;
pub use crate::machine::Machine;
pub use crate::positioning::{
    CancelHandle, CancelSignal, FaultReason, MoveOutcome, PrecisionPositioningController,
    cancel_pair,
};
pub use crate::status::StatusReader;
pub use crate::sync::{
    StatusPublisher, StatusSource, StatusSyncLoop, SyncHandle, SyncStatsSnapshot,
};
