//! Transport registry.
//!
//! Maps a driver name (`[fieldbus].driver`) to a `TransportFactory`. The
//! registry is built at startup and passed by value; there is no global state.

use bend_common::config::MachineConfig;
use bend_common::fieldbus::{FieldbusTransport, TransportFactory};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Error types for driver selection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    /// No driver registered under that name.
    #[error("Driver not found: {0}")]
    DriverNotFound(String),
}

/// Registry of available fieldbus transports.
pub struct DriverRegistry {
    factories: HashMap<&'static str, TransportFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding every built-in driver.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::drivers::register_all_drivers(&mut registry);
        registry
    }

    /// Register a transport factory.
    ///
    /// # Panics
    /// Panics if a driver with the same name is already registered.
    pub fn register(&mut self, name: &'static str, factory: TransportFactory) {
        if self.factories.contains_key(name) {
            panic!("Driver '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    /// Get a transport factory by name.
    pub fn get_factory(&self, name: &str) -> Option<TransportFactory> {
        self.factories.get(name).copied()
    }

    /// Create a transport by name.
    ///
    /// # Errors
    /// Returns `HalError::DriverNotFound` if no driver with the given name is registered.
    pub fn create_transport(
        &self,
        name: &str,
        config: &MachineConfig,
    ) -> Result<Arc<dyn FieldbusTransport>, HalError> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| HalError::DriverNotFound(name.to_string()))?;
        Ok(factory(config))
    }

    /// List all registered driver names.
    pub fn list_drivers(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::simulation;

    fn config() -> MachineConfig {
        MachineConfig::new("registry-test")
    }

    #[test]
    fn registry_register_and_create() {
        let mut reg = DriverRegistry::new();
        reg.register("sim", simulation::create_transport);

        let transport = reg.create_transport("sim", &config()).expect("should create");
        assert_eq!(transport.name(), "simulation");
        assert!(!transport.is_connected());
    }

    #[test]
    fn registry_driver_not_found() {
        let reg = DriverRegistry::new();
        let result = reg.create_transport("profibus", &config());
        assert!(matches!(result, Err(HalError::DriverNotFound(_))));
    }

    #[test]
    fn builtin_drivers_are_listed() {
        let mut names = DriverRegistry::with_builtin().list_drivers();
        names.sort();
        assert_eq!(names, vec!["modbus_tcp", "simulation"]);
    }

    #[test]
    fn builtin_modbus_driver_uses_fieldbus_section() {
        let transport = DriverRegistry::with_builtin()
            .create_transport("modbus_tcp", &config())
            .unwrap();
        assert_eq!(transport.name(), "modbus_tcp");
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn registry_duplicate_panics() {
        let mut reg = DriverRegistry::new();
        reg.register("dup", simulation::create_transport);
        reg.register("dup", simulation::create_transport);
    }
}
