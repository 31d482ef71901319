//! Per-axis building blocks.
//!
//! - [`model`] - Register ↔ millimetre translation (pure)
//! - [`drive`] - Output writes through the fieldbus

pub mod drive;
pub mod model;

pub use drive::AxisDrive;
pub use model::AxisPositionModel;
