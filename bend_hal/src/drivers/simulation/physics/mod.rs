//! Physics simulation module.
//!
//! Hydraulic axis motion driven by the simulated register bank.

mod axis;

pub use axis::AxisSimulator;
