//! In-memory Modbus data model.
//!
//! Unwritten addresses read as `false` / `0`, like a freshly powered rack.

use std::collections::HashMap;

/// Coils, holding registers and input registers of one simulated slave.
#[derive(Debug, Default, Clone)]
pub struct RegisterBank {
    coils: HashMap<u16, bool>,
    holding: HashMap<u16, u16>,
    inputs: HashMap<u16, u16>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn coil(&self, address: u16) -> bool {
        self.coils.get(&address).copied().unwrap_or(false)
    }

    #[inline]
    pub fn set_coil(&mut self, address: u16, value: bool) {
        self.coils.insert(address, value);
    }

    #[inline]
    pub fn holding(&self, address: u16) -> u16 {
        self.holding.get(&address).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set_holding(&mut self, address: u16, value: u16) {
        self.holding.insert(address, value);
    }

    #[inline]
    pub fn input(&self, address: u16) -> u16 {
        self.inputs.get(&address).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set_input(&mut self, address: u16, value: u16) {
        self.inputs.insert(address, value);
    }

    /// `count` consecutive coils starting at `address`.
    pub fn coils(&self, address: u16, count: u16) -> Vec<bool> {
        span(address, count).map(|a| self.coil(a)).collect()
    }

    pub fn holdings(&self, address: u16, count: u16) -> Vec<u16> {
        span(address, count).map(|a| self.holding(a)).collect()
    }

    pub fn inputs(&self, address: u16, count: u16) -> Vec<u16> {
        span(address, count).map(|a| self.input(a)).collect()
    }
}

fn span(address: u16, count: u16) -> impl Iterator<Item = u16> {
    (0..count).map_while(move |offset| address.checked_add(offset))
}
