//! Fieldbus transport trait, error and event types.
//!
//! This module defines:
//! - `FieldbusTransport` trait - Request/response access to one fieldbus slave
//! - `FieldbusError` enum - Error types for transport operations
//! - `FieldbusEvent` enum - Connection state and error notifications
//! - `TransportFactory` type alias - Factory function type
//!
//! # Contracts
//!
//! | Contract | Guarantee |
//! |----------|-----------|
//! | Connection | Every I/O call fails with `NotConnected` unless `connect()` succeeded |
//! | Ordering | At most one request is on the wire at a time |
//! | Retry | Applied per request inside the transport; exhausted retries disconnect |
//! | Batch | Per-address failures are replaced by `false` / `0`, never abort the batch |

use crate::config::MachineConfig;
use crate::status::ConnectionState;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Error types for fieldbus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldbusError {
    /// No established connection.
    #[error("Fieldbus not connected")]
    NotConnected,

    /// Connection attempt failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Request timed out after all retries.
    #[error("Request timed out (address {address})")]
    Timeout { address: u16 },

    /// I/O failure on the wire.
    #[error("Transport error at address {address}: {message}")]
    Transport { address: u16, message: String },

    /// The slave answered with a Modbus exception.
    #[error("Device exception at address {address}: {code}")]
    Exception { address: u16, code: String },

    /// The slave answered with an unexpected payload.
    #[error("Invalid response at address {address}: {message}")]
    InvalidResponse { address: u16, message: String },
}

impl FieldbusError {
    /// Address the failed request targeted, if any.
    pub fn address(&self) -> Option<u16> {
        match self {
            FieldbusError::NotConnected | FieldbusError::Connect(_) => None,
            FieldbusError::Timeout { address }
            | FieldbusError::Transport { address, .. }
            | FieldbusError::Exception { address, .. }
            | FieldbusError::InvalidResponse { address, .. } => Some(*address),
        }
    }

    /// True for errors that indicate the link itself is gone.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            FieldbusError::NotConnected
                | FieldbusError::Connect(_)
                | FieldbusError::Timeout { .. }
                | FieldbusError::Transport { .. }
        )
    }
}

/// Transport-level notification.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldbusEvent {
    ConnectionChanged {
        state: ConnectionState,
        reason: String,
    },
    Error {
        message: String,
        address: Option<u16>,
        cause: Option<String>,
    },
}

/// Factory function type for creating transport instances.
pub type TransportFactory = fn(&MachineConfig) -> Arc<dyn FieldbusTransport>;

/// Request/response access to one fieldbus slave.
///
/// Implementations own their connection handle exclusively and serialize
/// concurrent calls internally.
#[async_trait]
pub trait FieldbusTransport: Send + Sync {
    /// Driver identifier (e.g. "modbus_tcp", "simulation").
    fn name(&self) -> &'static str;

    // ─── Connection lifecycle ───────────────────────────────────────

    async fn connect(&self) -> Result<(), FieldbusError>;

    async fn disconnect(&self) -> Result<(), FieldbusError>;

    fn is_connected(&self) -> bool;

    /// Subscribe to connection and error notifications.
    fn subscribe(&self) -> broadcast::Receiver<FieldbusEvent>;

    // ─── Primitives ─────────────────────────────────────────────────

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, FieldbusError>;

    async fn write_coil(&self, address: u16, value: bool) -> Result<(), FieldbusError>;

    async fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), FieldbusError>;

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldbusError>;

    async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), FieldbusError>;

    async fn write_holding_registers(
        &self,
        address: u16,
        values: &[u16],
    ) -> Result<(), FieldbusError>;

    async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldbusError>;

    // ─── Single-value helpers ───────────────────────────────────────

    async fn read_coil(&self, address: u16) -> Result<bool, FieldbusError> {
        first(address, self.read_coils(address, 1).await?)
    }

    async fn read_holding_register(&self, address: u16) -> Result<u16, FieldbusError> {
        first(address, self.read_holding_registers(address, 1).await?)
    }

    /// Holding register interpreted as two's complement.
    async fn read_holding_register_signed(&self, address: u16) -> Result<i16, FieldbusError> {
        Ok(self.read_holding_register(address).await? as i16)
    }

    async fn read_input_register(&self, address: u16) -> Result<u16, FieldbusError> {
        first(address, self.read_input_registers(address, 1).await?)
    }

    /// Input register interpreted as two's complement.
    async fn read_input_register_signed(&self, address: u16) -> Result<i16, FieldbusError> {
        Ok(self.read_input_register(address).await? as i16)
    }

    async fn write_holding_register_signed(
        &self,
        address: u16,
        value: i16,
    ) -> Result<(), FieldbusError> {
        self.write_holding_register(address, value as u16).await
    }

    // ─── Batch reads ────────────────────────────────────────────────

    /// Read independent coils; failed addresses read as `false`.
    async fn read_coils_batch(&self, addresses: &[u16]) -> BTreeMap<u16, bool> {
        let mut out = BTreeMap::new();
        for &address in addresses {
            let value = match self.read_coil(address).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(address, error = %e, "batch coil read failed, using false");
                    false
                }
            };
            out.insert(address, value);
        }
        out
    }

    /// Read independent input registers; failed addresses read as `0`.
    async fn read_input_registers_batch(&self, addresses: &[u16]) -> BTreeMap<u16, u16> {
        let mut out = BTreeMap::new();
        for &address in addresses {
            let value = match self.read_input_register(address).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(address, error = %e, "batch input read failed, using 0");
                    0
                }
            };
            out.insert(address, value);
        }
        out
    }

    /// Read independent holding registers; failed addresses read as `0`.
    async fn read_holding_registers_batch(&self, addresses: &[u16]) -> BTreeMap<u16, u16> {
        let mut out = BTreeMap::new();
        for &address in addresses {
            let value = match self.read_holding_register(address).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(address, error = %e, "batch holding read failed, using 0");
                    0
                }
            };
            out.insert(address, value);
        }
        out
    }
}

fn first<T: Copy>(address: u16, values: Vec<T>) -> Result<T, FieldbusError> {
    values
        .first()
        .copied()
        .ok_or_else(|| FieldbusError::InvalidResponse {
            address,
            message: "empty response".to_string(),
        })
}
