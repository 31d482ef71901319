//! Fieldbus transport implementations.
//!
//! - [`modbus_tcp`] - Modbus-TCP client for the I/O rack
//! - [`simulation`] - In-memory slave for development and testing
//!
//! # Adding New Drivers
//!
//! 1. Create a new submodule under `drivers/`
//! 2. Implement the `FieldbusTransport` trait from `bend_common::fieldbus`
//! 3. Register its factory in `register_all_drivers()`

pub mod modbus_tcp;
pub mod simulation;

use crate::driver_registry::DriverRegistry;
use bend_common::config::MachineConfig;
use bend_common::fieldbus::FieldbusTransport;
use std::sync::Arc;

/// Factory for the Modbus-TCP transport.
pub fn create_modbus_tcp(config: &MachineConfig) -> Arc<dyn FieldbusTransport> {
    Arc::new(modbus_tcp::ModbusTcpTransport::new(config.fieldbus.clone()))
}

/// Register all built-in drivers.
pub fn register_all_drivers(registry: &mut DriverRegistry) {
    registry.register("modbus_tcp", create_modbus_tcp);
    registry.register("simulation", simulation::create_transport);
}
