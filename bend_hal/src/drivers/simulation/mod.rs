//! Simulation driver module.
//!
//! In-memory fieldbus slave for development and testing without a rack.

mod bank;
mod physics;
mod transport;

pub use bank::RegisterBank;
pub use physics::AxisSimulator;
pub use transport::SimulatedTransport;

use bend_common::config::MachineConfig;
use bend_common::fieldbus::FieldbusTransport;
use std::sync::Arc;

/// Factory function to create a simulated transport instance.
pub fn create_transport(config: &MachineConfig) -> Arc<dyn FieldbusTransport> {
    Arc::new(SimulatedTransport::from_config(config))
}
