//! Output driving for one axis.
//!
//! `AxisDrive` is the only place that turns a direction and speed into
//! fieldbus writes. Voltage axes get a signed analog output plus their valve
//! coil; coil axes get exactly one of their two direction coils.

use super::AxisPositionModel;
use bend_common::axis::{Actuation, AxisCalibration, Direction};
use bend_common::fieldbus::{FieldbusError, FieldbusTransport};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AxisDrive {
    /// Voltage scaling only; positions are decoded by the caller's model.
    model: AxisPositionModel,
    transport: Arc<dyn FieldbusTransport>,
}

impl AxisDrive {
    pub fn new(calibration: Arc<AxisCalibration>, transport: Arc<dyn FieldbusTransport>) -> Self {
        Self {
            model: AxisPositionModel::new(calibration),
            transport,
        }
    }

    #[inline]
    pub fn calibration(&self) -> &Arc<AxisCalibration> {
        self.model.calibration()
    }

    /// Read the ruler register (two's complement on signed axes).
    pub async fn read_raw(&self) -> Result<i32, FieldbusError> {
        let calibration = self.calibration();
        let register = calibration.ruler_register;
        if calibration.ruler.is_signed() {
            Ok(self.transport.read_input_register_signed(register).await? as i32)
        } else {
            Ok(self.transport.read_input_register(register).await? as i32)
        }
    }

    /// Command motion in `direction` at `speed_percent` of full scale.
    ///
    /// Returns the commanded output voltage (0.0 for coil axes).
    pub async fn drive(&self, direction: Direction, speed_percent: f64) -> Result<f64, FieldbusError> {
        let axis = self.model.id();
        match self.calibration().actuation {
            Actuation::Voltage {
                register,
                valve_coil,
            } => {
                let volts = self.model.drive_voltage(direction, speed_percent);
                let word = self.model.voltage_to_register(volts);
                self.transport
                    .write_holding_register_signed(register, word)
                    .await?;
                if let Some(coil) = valve_coil {
                    self.transport.write_coil(coil, true).await?;
                }
                let commanded = self.model.register_to_voltage(word as i32);
                debug!(%axis, ?direction, speed_percent, volts = commanded, "drive");
                Ok(commanded)
            }
            Actuation::Coil {
                forward_coil,
                backward_coil,
            } => {
                let (on, off) = match direction {
                    Direction::Forward => (forward_coil, backward_coil),
                    Direction::Backward => (backward_coil, forward_coil),
                };
                // Release the opposite coil first so both are never set together.
                self.transport.write_coil(off, false).await?;
                self.transport.write_coil(on, true).await?;
                debug!(%axis, ?direction, "drive (coil)");
                Ok(0.0)
            }
        }
    }

    /// Zero the output and close the valve / release both coils.
    ///
    /// Every write is attempted; the first failure is returned.
    pub async fn stop(&self) -> Result<(), FieldbusError> {
        let axis = self.model.id();
        let results = match self.calibration().actuation {
            Actuation::Voltage {
                register,
                valve_coil,
            } => {
                let output = self.transport.write_holding_register(register, 0).await;
                let valve = match valve_coil {
                    Some(coil) => self.transport.write_coil(coil, false).await,
                    None => Ok(()),
                };
                [output, valve]
            }
            Actuation::Coil {
                forward_coil,
                backward_coil,
            } => [
                self.transport.write_coil(forward_coil, false).await,
                self.transport.write_coil(backward_coil, false).await,
            ],
        };

        let mut first = None;
        for result in results {
            if let Err(e) = result {
                warn!(%axis, error = %e, "stop write failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                debug!(%axis, "outputs released");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for AxisDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxisDrive")
            .field("axis", &self.model.id())
            .field("transport", &self.transport.name())
            .finish()
    }
}
