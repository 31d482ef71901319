//! Bender Common Library
//!
//! Shared types for all bender workspace crates: physical unit conversions,
//! the axis data model, the machine configuration, status snapshots, events
//! and the fieldbus transport contract.
//!
//! # Module Structure
//!
//! - [`consts`] - Electrical ranges and default cadences
//! - [`convert`] - Pure register ↔ physical unit conversions
//! - [`config`] - Configuration loading traits and machine configuration
//! - [`axis`] - Axis identifiers, calibration and runtime state
//! - [`status`] - Machine status snapshot and safety flags
//! - [`event`] - Machine notifications
//! - [`fieldbus`] - Fieldbus transport trait and errors
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use bend_common::convert::register_to_voltage;
//! use bend_common::config::{ConfigLoader, MachineConfig};
//! ```

pub mod axis;
pub mod config;
pub mod consts;
pub mod convert;
pub mod event;
pub mod fieldbus;
pub mod prelude;
pub mod status;
