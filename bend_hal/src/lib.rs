//! # Bender HAL Library
//!
//! Fieldbus transports for the profile bender. Every driver implements
//! `bend_common::fieldbus::FieldbusTransport`.
//!
//! # Module Structure
//!
//! - [`driver_registry`] - Driver name → factory lookup
//! - [`drivers`] - Transport implementations (Modbus-TCP, simulation)
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         bend_hal                              │
//! │  ┌──────────────────┐        ┌─────────────────────────────┐  │
//! │  │ DriverRegistry   │───────►│ dyn FieldbusTransport       │  │
//! │  │ "modbus_tcp"     │        │  ├─ ModbusTcpTransport      │──┼──► I/O rack
//! │  │ "simulation"     │        │  └─ SimulatedTransport      │  │
//! │  └──────────────────┘        └─────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod driver_registry;
pub mod drivers;

pub use crate::driver_registry::{DriverRegistry, HalError};
pub use crate::drivers::modbus_tcp::ModbusTcpTransport;
pub use crate::drivers::simulation::SimulatedTransport;
