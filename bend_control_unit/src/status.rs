//! Status acquisition.
//!
//! One poll reads every configured point with the transport's batch reads
//! (coils, input registers, holding registers) into a [`RawStatus`], then
//! decodes it into snapshot parts. Addresses that fail individually read as
//! `false` / `0`, except safety inputs: those are read one by one and an
//! unreadable safety input counts as raised. A transport that dropped its
//! connection during the poll fails the whole poll.

use crate::axis::AxisPositionModel;
use bend_common::axis::{Actuation, Motion};
use bend_common::config::{MachineConfig, NamedCoil, SafetyInputs, SensorKind};
use bend_common::convert::{
    PressureScale, encoder_pulses_to_millimeters, milliamps_to_celsius, milliamps_to_flow_rate,
    milliamps_to_humidity, register_to_bar, register_to_milliamps,
};
use bend_common::fieldbus::{FieldbusError, FieldbusTransport};
use bend_common::status::{SafetyFlags, SensorReadings};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{trace, warn};

/// Raw values of one poll, keyed by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStatus {
    pub coils: BTreeMap<u16, bool>,
    pub inputs: BTreeMap<u16, u16>,
    pub holdings: BTreeMap<u16, u16>,
    /// Safety inputs whose read failed in this poll.
    pub unreadable_safety: BTreeSet<u16>,
}

impl RawStatus {
    #[inline]
    pub fn coil(&self, address: u16) -> bool {
        self.coils.get(&address).copied().unwrap_or(false)
    }

    #[inline]
    pub fn input(&self, address: u16) -> u16 {
        self.inputs.get(&address).copied().unwrap_or(0)
    }

    #[inline]
    pub fn holding(&self, address: u16) -> u16 {
        self.holdings.get(&address).copied().unwrap_or(0)
    }
}

/// Decoded readback of one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisReading {
    pub raw: i32,
    /// Output voltage readback (0.0 on coil axes).
    pub voltage: f64,
    /// Motion implied by the output readback.
    pub motion: Motion,
}

/// Reads and decodes the machine's configured points.
#[derive(Debug, Clone)]
pub struct StatusReader {
    config: Arc<MachineConfig>,
    coil_addresses: Vec<u16>,
    input_addresses: Vec<u16>,
    holding_addresses: Vec<u16>,
    safety_addresses: Vec<u16>,
}

impl StatusReader {
    pub fn new(config: Arc<MachineConfig>) -> Self {
        let safety_addresses: Vec<u16> = safety_points(&config.safety)
            .into_iter()
            .filter_map(|(address, _)| address)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut coils = BTreeSet::new();
        let mut inputs = BTreeSet::new();
        let mut holdings = BTreeSet::new();

        for group in [
            &config.motors,
            &config.valves,
            &config.part_presence,
            &config.pollution,
        ] {
            coils.extend(group.iter().map(|point| point.coil));
        }
        for axis in &config.axes {
            inputs.insert(axis.ruler_register);
            match axis.actuation {
                Actuation::Voltage {
                    register,
                    valve_coil,
                } => {
                    holdings.insert(register);
                    coils.extend(valve_coil);
                }
                Actuation::Coil {
                    forward_coil,
                    backward_coil,
                } => {
                    coils.insert(forward_coil);
                    coils.insert(backward_coil);
                }
            }
        }
        inputs.extend(config.sensors.iter().map(|sensor| sensor.register));
        for address in &safety_addresses {
            coils.remove(address);
        }

        Self {
            config,
            coil_addresses: coils.into_iter().collect(),
            input_addresses: inputs.into_iter().collect(),
            holding_addresses: holdings.into_iter().collect(),
            safety_addresses,
        }
    }

    /// Read every configured point.
    pub async fn acquire(&self, transport: &dyn FieldbusTransport) -> Result<RawStatus, FieldbusError> {
        if !transport.is_connected() {
            return Err(FieldbusError::NotConnected);
        }
        let mut coils = transport.read_coils_batch(&self.coil_addresses).await;
        let mut unreadable_safety = BTreeSet::new();
        for &address in &self.safety_addresses {
            match transport.read_coil(address).await {
                Ok(value) => {
                    coils.insert(address, value);
                }
                Err(e) => {
                    warn!(address, error = %e, "safety input unreadable, treating as raised");
                    unreadable_safety.insert(address);
                }
            }
        }
        let inputs = transport.read_input_registers_batch(&self.input_addresses).await;
        let holdings = transport
            .read_holding_registers_batch(&self.holding_addresses)
            .await;

        // Exhausted retries inside the batch dropped the link.
        if !transport.is_connected() {
            return Err(FieldbusError::NotConnected);
        }
        trace!(
            coils = coils.len(),
            inputs = inputs.len(),
            holdings = holdings.len(),
            "status acquired"
        );
        Ok(RawStatus {
            coils,
            inputs,
            holdings,
            unreadable_safety,
        })
    }

    /// Read only the safety chain. Any input that cannot be read fails the call.
    pub async fn read_safety(&self, transport: &dyn FieldbusTransport) -> Result<SafetyFlags, FieldbusError> {
        if !transport.is_connected() {
            return Err(FieldbusError::NotConnected);
        }
        let mut coils = BTreeMap::new();
        for &address in &self.safety_addresses {
            coils.insert(address, transport.read_coil(address).await?);
        }
        Ok(self.safety(&RawStatus {
            coils,
            ..RawStatus::default()
        }))
    }

    // ─── Decoding ───────────────────────────────────────────────────

    /// Flags whose input is set or could not be read.
    pub fn safety(&self, raw: &RawStatus) -> SafetyFlags {
        safety_points(&self.config.safety)
            .into_iter()
            .filter(|(address, _)| {
                address.is_some_and(|a| raw.coil(a) || raw.unreadable_safety.contains(&a))
            })
            .fold(SafetyFlags::empty(), |flags, (_, flag)| flags | flag)
    }

    pub fn motors(&self, raw: &RawStatus) -> BTreeMap<String, bool> {
        named(&self.config.motors, raw)
    }

    pub fn valves(&self, raw: &RawStatus) -> BTreeMap<String, bool> {
        named(&self.config.valves, raw)
    }

    pub fn sensors(&self, raw: &RawStatus) -> SensorReadings {
        let mut readings = SensorReadings {
            part_presence: named(&self.config.part_presence, raw),
            pollution: named(&self.config.pollution, raw),
            ..SensorReadings::default()
        };

        for sensor in &self.config.sensors {
            let value = raw.input(sensor.register) as i64;
            let milliamps = register_to_milliamps(value, sensor.register_count);
            let name = sensor.name.clone();
            match sensor.kind {
                SensorKind::Pressure { min_bar, max_bar } => {
                    let scale = PressureScale::new(min_bar, max_bar);
                    readings
                        .pressures
                        .insert(name, register_to_bar(value, sensor.register_count, &scale));
                }
                SensorKind::Temperature => {
                    readings
                        .temperatures
                        .insert(name, milliamps_to_celsius(milliamps));
                }
                SensorKind::Humidity => {
                    readings.humidity.insert(name, milliamps_to_humidity(milliamps));
                }
                SensorKind::FlowRate => {
                    readings
                        .flow_rates
                        .insert(name, milliamps_to_flow_rate(milliamps));
                }
                SensorKind::Encoder {
                    ball_diameter_mm,
                    pulses_per_revolution,
                } => {
                    let distance =
                        encoder_pulses_to_millimeters(value, ball_diameter_mm, pulses_per_revolution);
                    readings.distances.insert(name, distance);
                }
            }
        }
        readings
    }

    /// Ruler reading and output readback of one axis.
    pub fn axis(&self, model: &AxisPositionModel, raw: &RawStatus) -> AxisReading {
        let calibration = model.calibration();
        let word = raw.input(calibration.ruler_register);
        let ruler = if calibration.ruler.is_signed() {
            word as i16 as i32
        } else {
            word as i32
        };

        match calibration.actuation {
            Actuation::Voltage {
                register,
                valve_coil,
            } => {
                let voltage = model.register_to_voltage(raw.holding(register) as i16 as i32);
                let valve_open = valve_coil.is_none_or(|coil| raw.coil(coil));
                AxisReading {
                    raw: ruler,
                    voltage,
                    motion: model.motion_from_voltage(voltage, valve_open),
                }
            }
            Actuation::Coil {
                forward_coil,
                backward_coil,
            } => {
                let motion = match (raw.coil(forward_coil), raw.coil(backward_coil)) {
                    (true, false) => Motion::Forward,
                    (false, true) => Motion::Backward,
                    _ => Motion::Closed,
                };
                AxisReading {
                    raw: ruler,
                    voltage: 0.0,
                    motion,
                }
            }
        }
    }
}

fn safety_points(inputs: &SafetyInputs) -> [(Option<u16>, SafetyFlags); 5] {
    [
        (inputs.emergency_stop, SafetyFlags::EMERGENCY_STOP),
        (inputs.thermal_main_motor, SafetyFlags::THERMAL_MAIN_MOTOR),
        (inputs.thermal_pump_motor, SafetyFlags::THERMAL_PUMP_MOTOR),
        (inputs.phase_sequence, SafetyFlags::PHASE_SEQUENCE),
        (inputs.alarm, SafetyFlags::ALARM),
    ]
}

fn named(points: &[NamedCoil], raw: &RawStatus) -> BTreeMap<String, bool> {
    points
        .iter()
        .map(|point| (point.name.clone(), raw.coil(point.coil)))
        .collect()
}
