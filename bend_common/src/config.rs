//! Configuration loading traits and machine configuration types.
//!
//! The whole machine is described by one TOML file, deserialized into
//! [`MachineConfig`] and validated once at startup. Nothing is written back.
//!
//! | Section | Type | Purpose |
//! |---------|------|---------|
//! | `[shared]` | [`SharedConfig`] | Service name, log level |
//! | `[fieldbus]` | [`FieldbusConfig`] | Modbus-TCP endpoint and retry policy |
//! | `[sync]` | [`SyncConfig`] | Status loop cadence |
//! | `[positioning]` | [`PositioningConfig`] | Sampling, freeze/timeout limits, speed profile |
//! | `[[axes]]` | [`AxisCalibration`] | Per-axis calibration |
//! | `[safety]` | [`SafetyInputs`] | Safety input coils |
//! | `[[motors]]` … | [`NamedCoil`] | Motor, valve, presence, pollution coils |
//! | `[[sensors]]` | [`SensorConfig`] | Analog process sensors |
//!
//! # Usage
//!
//! ```rust,no_run
//! use bend_common::config::{ConfigLoader, MachineConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MachineConfig::load(Path::new("machine.toml"))?;
//!     config.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::axis::{AxisCalibration, AxisId};
use crate::consts::{
    DEFAULT_DURATION_WINDOW, DEFAULT_GATE_WAIT_MS, DEFAULT_MODBUS_PORT, DEFAULT_RECONNECT_POLL_MS,
    DEFAULT_REGISTER_COUNT, DEFAULT_SYNC_PERIOD_MS,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "bender-line-2"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Machine instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
///
/// Semantic validation is the caller's job (`MachineConfig::validate`).
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Fieldbus ───────────────────────────────────────────────────────

fn default_port() -> u16 {
    DEFAULT_MODBUS_PORT
}
fn default_slave_id() -> u8 {
    1
}
fn default_timeout_ms() -> u64 {
    1000
}
fn default_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    50
}
fn default_driver() -> String {
    "modbus_tcp".to_string()
}

/// Fieldbus endpoint and per-request retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldbusConfig {
    /// IP address or host name of the I/O controller.
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Modbus unit identifier.
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    /// Bound on a single request/response round trip.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after the first failed one.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Transport driver name (`modbus_tcp`, `simulation`).
    #[serde(default = "default_driver")]
    pub driver: String,
}

impl Default for FieldbusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_port(),
            slave_id: default_slave_id(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            driver: default_driver(),
        }
    }
}

impl FieldbusConfig {
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[inline]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ─── Status synchronization ─────────────────────────────────────────

fn default_sync_period_ms() -> u64 {
    DEFAULT_SYNC_PERIOD_MS
}
fn default_gate_wait_ms() -> u64 {
    DEFAULT_GATE_WAIT_MS
}
fn default_reconnect_poll_ms() -> u64 {
    DEFAULT_RECONNECT_POLL_MS
}
fn default_duration_window() -> usize {
    DEFAULT_DURATION_WINDOW
}
fn default_true() -> bool {
    true
}

/// Status loop cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_period_ms")]
    pub period_ms: u64,
    /// Wait bound on the single-slot poll gate.
    #[serde(default = "default_gate_wait_ms")]
    pub gate_wait_ms: u64,
    /// Connection check interval while disconnected.
    #[serde(default = "default_reconnect_poll_ms")]
    pub reconnect_poll_ms: u64,
    /// Number of cycle durations kept for the rolling average.
    #[serde(default = "default_duration_window")]
    pub duration_window: usize,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            period_ms: default_sync_period_ms(),
            gate_wait_ms: default_gate_wait_ms(),
            reconnect_poll_ms: default_reconnect_poll_ms(),
            duration_window: default_duration_window(),
            auto_reconnect: true,
        }
    }
}

impl SyncConfig {
    #[inline]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    #[inline]
    pub fn gate_wait(&self) -> Duration {
        Duration::from_millis(self.gate_wait_ms)
    }

    #[inline]
    pub fn reconnect_poll(&self) -> Duration {
        Duration::from_millis(self.reconnect_poll_ms)
    }
}

// ─── Positioning ────────────────────────────────────────────────────

/// One step of the deceleration profile: travel at `speed_percent` until
/// `until_fraction` of the move distance has been covered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedStage {
    pub until_fraction: f64,
    pub speed_percent: f64,
}

/// Decelerating multi-stage speed profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeedProfile {
    pub stages: Vec<SpeedStage>,
}

impl Default for SpeedProfile {
    fn default() -> Self {
        let stages = [
            (0.50, 60.0),
            (0.70, 40.0),
            (0.85, 25.0),
            (0.93, 15.0),
            (0.97, 8.0),
            (1.00, 4.0),
        ]
        .into_iter()
        .map(|(until_fraction, speed_percent)| SpeedStage {
            until_fraction,
            speed_percent,
        })
        .collect();
        Self { stages }
    }
}

impl SpeedProfile {
    /// Index of the stage that applies once `fraction` of the distance is covered.
    ///
    /// Fractions past the last threshold (overshoot) map to the last stage.
    pub fn stage_for(&self, fraction: f64) -> usize {
        self.stages
            .iter()
            .position(|stage| fraction < stage.until_fraction)
            .unwrap_or(self.stages.len().saturating_sub(1))
    }

    /// Index of the final (slowest) stage.
    #[inline]
    pub fn last_stage(&self) -> usize {
        self.stages.len().saturating_sub(1)
    }

    /// Speed of stage `index`, clamped to the last stage.
    pub fn speed_percent(&self, index: usize) -> f64 {
        self.stages
            .get(index.min(self.last_stage()))
            .map_or(0.0, |stage| stage.speed_percent)
    }

    /// Validate the profile.
    ///
    /// # Validation Rules
    /// 1. At least one stage
    /// 2. Fractions strictly increasing in (0, 1], last one exactly 1.0
    /// 3. Speeds in (0, 100] and non-increasing
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(last) = self.stages.last() else {
            return Err(ConfigError::ValidationError(
                "speed profile needs at least one stage".to_string(),
            ));
        };
        if (last.until_fraction - 1.0).abs() > f64::EPSILON {
            return Err(ConfigError::ValidationError(format!(
                "last speed stage must end at 1.0, got {}",
                last.until_fraction
            )));
        }
        let mut prev: Option<&SpeedStage> = None;
        for stage in &self.stages {
            if !(stage.until_fraction > 0.0 && stage.until_fraction <= 1.0) {
                return Err(ConfigError::ValidationError(format!(
                    "stage fraction {} outside (0, 1]",
                    stage.until_fraction
                )));
            }
            if !(stage.speed_percent > 0.0 && stage.speed_percent <= 100.0) {
                return Err(ConfigError::ValidationError(format!(
                    "stage speed {}% outside (0, 100]",
                    stage.speed_percent
                )));
            }
            if let Some(p) = prev {
                if stage.until_fraction <= p.until_fraction {
                    return Err(ConfigError::ValidationError(format!(
                        "stage fractions must strictly increase ({} after {})",
                        stage.until_fraction, p.until_fraction
                    )));
                }
                if stage.speed_percent > p.speed_percent {
                    return Err(ConfigError::ValidationError(format!(
                        "stage speeds must not increase ({}% after {}%)",
                        stage.speed_percent, p.speed_percent
                    )));
                }
            }
            prev = Some(stage);
        }
        Ok(())
    }
}

fn default_sample_period_ms() -> u64 {
    50
}
fn default_approach_sample_period_ms() -> u64 {
    20
}
fn default_settle_samples() -> u32 {
    3
}
fn default_max_stuck_samples() -> u32 {
    20
}
fn default_move_timeout_ms() -> u64 {
    60_000
}
fn default_drift_tolerance_mm() -> f64 {
    2.0
}

/// Precision positioning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositioningConfig {
    /// Sampling period while seeking.
    #[serde(default = "default_sample_period_ms")]
    pub sample_period_ms: u64,
    /// Tightened sampling period in the final stage.
    #[serde(default = "default_approach_sample_period_ms")]
    pub approach_sample_period_ms: u64,
    /// Consecutive in-tolerance samples required to settle.
    #[serde(default = "default_settle_samples")]
    pub settle_samples: u32,
    /// Consecutive unchanged raw samples (under command) that fault the move.
    #[serde(default = "default_max_stuck_samples")]
    pub max_stuck_samples: u32,
    #[serde(default = "default_move_timeout_ms")]
    pub move_timeout_ms: u64,
    /// Allowed growth of the remaining distance within one stage [mm].
    #[serde(default = "default_drift_tolerance_mm")]
    pub drift_tolerance_mm: f64,
    #[serde(default)]
    pub stages: SpeedProfile,
}

impl Default for PositioningConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: default_sample_period_ms(),
            approach_sample_period_ms: default_approach_sample_period_ms(),
            settle_samples: default_settle_samples(),
            max_stuck_samples: default_max_stuck_samples(),
            move_timeout_ms: default_move_timeout_ms(),
            drift_tolerance_mm: default_drift_tolerance_mm(),
            stages: SpeedProfile::default(),
        }
    }
}

impl PositioningConfig {
    #[inline]
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    #[inline]
    pub fn approach_sample_period(&self) -> Duration {
        Duration::from_millis(self.approach_sample_period_ms)
    }

    #[inline]
    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }
}

// ─── Digital and analog inputs ──────────────────────────────────────

/// Coil addresses of the safety chain. Absent inputs read as healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetyInputs {
    pub emergency_stop: Option<u16>,
    pub thermal_main_motor: Option<u16>,
    pub thermal_pump_motor: Option<u16>,
    pub phase_sequence: Option<u16>,
    pub alarm: Option<u16>,
}

/// A named digital point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCoil {
    pub name: String,
    pub coil: u16,
}

/// Physical quantity behind an analog input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorKind {
    Pressure { min_bar: f64, max_bar: f64 },
    Temperature,
    Humidity,
    FlowRate,
    Encoder {
        ball_diameter_mm: f64,
        pulses_per_revolution: u32,
    },
}

/// A named analog input.
///
/// ```toml
/// [[sensors]]
/// name = "main_pressure"
/// register = 40
/// kind = { type = "pressure", min_bar = 0.0, max_bar = 250.0 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub register: u16,
    #[serde(default = "default_sensor_register_count")]
    pub register_count: u32,
    pub kind: SensorKind,
}

fn default_sensor_register_count() -> u32 {
    DEFAULT_REGISTER_COUNT
}

// ─── Machine ────────────────────────────────────────────────────────

/// Root of the machine configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub shared: SharedConfig,
    #[serde(default)]
    pub fieldbus: FieldbusConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub positioning: PositioningConfig,
    #[serde(default)]
    pub axes: Vec<AxisCalibration>,
    #[serde(default)]
    pub safety: SafetyInputs,
    #[serde(default)]
    pub motors: Vec<NamedCoil>,
    #[serde(default)]
    pub valves: Vec<NamedCoil>,
    #[serde(default)]
    pub part_presence: Vec<NamedCoil>,
    #[serde(default)]
    pub pollution: Vec<NamedCoil>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

impl MachineConfig {
    /// Configuration with the given service name, defaults everywhere else and no axes.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            shared: SharedConfig {
                log_level: LogLevel::Info,
                service_name: service_name.into(),
            },
            fieldbus: FieldbusConfig::default(),
            sync: SyncConfig::default(),
            positioning: PositioningConfig::default(),
            axes: Vec::new(),
            safety: SafetyInputs::default(),
            motors: Vec::new(),
            valves: Vec::new(),
            part_presence: Vec::new(),
            pollution: Vec::new(),
            sensors: Vec::new(),
        }
    }

    /// Calibration lookup by identifier.
    pub fn axis(&self, id: AxisId) -> Option<&AxisCalibration> {
        self.axes.iter().find(|axis| axis.id == id)
    }

    /// Validate the whole machine description.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if self.fieldbus.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "fieldbus.host cannot be empty".to_string(),
            ));
        }
        if self.fieldbus.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "fieldbus.timeout_ms must be > 0".to_string(),
            ));
        }

        let sync = &self.sync;
        if sync.period_ms == 0 || sync.gate_wait_ms == 0 || sync.reconnect_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sync periods must be > 0".to_string(),
            ));
        }
        if sync.duration_window == 0 {
            return Err(ConfigError::ValidationError(
                "sync.duration_window must be > 0".to_string(),
            ));
        }

        let pos = &self.positioning;
        if pos.sample_period_ms == 0 || pos.approach_sample_period_ms == 0 || pos.move_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "positioning periods must be > 0".to_string(),
            ));
        }
        if pos.settle_samples == 0 || pos.max_stuck_samples == 0 {
            return Err(ConfigError::ValidationError(
                "positioning sample counts must be > 0".to_string(),
            ));
        }
        if !(pos.drift_tolerance_mm >= 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "positioning.drift_tolerance_mm must be >= 0, got {}",
                pos.drift_tolerance_mm
            )));
        }
        pos.stages.validate()?;

        let mut seen = HashSet::new();
        for axis in &self.axes {
            if !seen.insert(axis.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate axis id: {}",
                    axis.id
                )));
            }
            axis.validate()?;
        }

        for (group, coils) in [
            ("motors", &self.motors),
            ("valves", &self.valves),
            ("part_presence", &self.part_presence),
            ("pollution", &self.pollution),
        ] {
            let mut names = HashSet::new();
            for coil in coils {
                if !names.insert(coil.name.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "duplicate name '{}' in {group}",
                        coil.name
                    )));
                }
            }
        }

        let mut names = HashSet::new();
        for sensor in &self.sensors {
            if !names.insert(sensor.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate sensor name '{}'",
                    sensor.name
                )));
            }
            if sensor.register_count == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "sensor '{}': register_count must be > 0",
                    sensor.name
                )));
            }
            match sensor.kind {
                SensorKind::Pressure { min_bar, max_bar } if min_bar >= max_bar => {
                    return Err(ConfigError::ValidationError(format!(
                        "sensor '{}': min_bar must be < max_bar",
                        sensor.name
                    )));
                }
                SensorKind::Encoder {
                    ball_diameter_mm,
                    pulses_per_revolution,
                } if !(ball_diameter_mm > 0.0) || pulses_per_revolution == 0 => {
                    return Err(ConfigError::ValidationError(format!(
                        "sensor '{}': encoder needs a positive diameter and pulse count",
                        sensor.name
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
