//! Raw fieldbus value ↔ physical unit conversions.
//!
//! Every function here is pure: no state, no I/O, no panics. Out-of-range
//! inputs are clamped to the documented physical range, never rejected.
//!
//! ## Precision
//!
//! | Quantity                 | Decimals |
//! |--------------------------|----------|
//! | mm, bar, V, mA, L/min    | 2        |
//! | °C, %RH, percentage      | 1        |
//! | registers, pulses        | 0        |
//!
//! ## Current loop
//!
//! Analog sensors are 4–20 mA transmitters digitised into `[0, register_count]`.
//! 4 mA is the "no signal" floor: anything at or below raw 0 maps to the
//! minimum physical value.

use crate::consts::{
    CURRENT_MAX_MA, CURRENT_MIN_MA, REGISTERS_PER_VOLT, VOLTAGE_MAX, VOLTAGE_MIN,
    VOLTAGE_REGISTER_MAX, VOLTAGE_REGISTER_MIN,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Temperature transmitter span [°C] over 4–20 mA.
pub const TEMPERATURE_SPAN_C: (f64, f64) = (0.0, 150.0);

/// Humidity transmitter span [%RH] over 4–20 mA.
pub const HUMIDITY_SPAN_PCT: (f64, f64) = (0.0, 100.0);

/// Flow meter span [L/min] over 4–20 mA.
pub const FLOW_SPAN_LPM: (f64, f64) = (0.0, 300.0);

/// Relative area threshold below which three points count as colinear.
const COLINEAR_EPSILON: f64 = 1e-9;

/// Round `value` to `decimals` decimal places.
#[inline]
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

// ─── Angles ─────────────────────────────────────────────────────────

/// Degrees → radians.
#[inline]
pub fn degrees_to_radians(degrees: f64) -> f64 {
    degrees * PI / 180.0
}

/// Radians → degrees.
#[inline]
pub fn radians_to_degrees(radians: f64) -> f64 {
    radians * 180.0 / PI
}

// ─── Command voltage ────────────────────────────────────────────────

/// Analog output register → command voltage.
///
/// Symmetric scale: register 0 is 0 V, −2048 is −10 V, 2047 is +9.995 V
/// (reported as 10.0 after rounding).
pub fn register_to_voltage(register: i32) -> f64 {
    let r = register.clamp(VOLTAGE_REGISTER_MIN, VOLTAGE_REGISTER_MAX) as f64;
    round_to((r / REGISTERS_PER_VOLT).clamp(VOLTAGE_MIN, VOLTAGE_MAX), 2)
}

/// Command voltage → analog output register (nearest integer, clamped).
///
/// A NaN voltage yields register 0, i.e. no drive.
pub fn voltage_to_register(voltage: f64) -> i16 {
    if voltage.is_nan() {
        return 0;
    }
    let v = voltage.clamp(VOLTAGE_MIN, VOLTAGE_MAX);
    let r = (v * REGISTERS_PER_VOLT).round() as i32;
    r.clamp(VOLTAGE_REGISTER_MIN, VOLTAGE_REGISTER_MAX) as i16
}

// ─── Current loop ───────────────────────────────────────────────────

/// Fraction of full scale for a raw reading, clamped to `[0, 1]`.
///
/// A zero `register_count` is treated as "no signal".
#[inline]
pub fn normalized(raw: i64, register_count: u32) -> f64 {
    if register_count == 0 {
        return 0.0;
    }
    let count = register_count as i64;
    raw.clamp(0, count) as f64 / count as f64
}

/// Normalised current-loop fraction for a loop current, clamped to `[0, 1]`.
#[inline]
fn current_fraction(milliamps: f64, min_ma: f64, max_ma: f64) -> f64 {
    let span = max_ma - min_ma;
    if span.abs() < f64::EPSILON || milliamps.is_nan() {
        return 0.0;
    }
    ((milliamps - min_ma) / span).clamp(0.0, 1.0)
}

/// Map a fraction back to the nearest register in `[0, register_count]`.
#[inline]
fn fraction_to_register(fraction: f64, register_count: u32) -> u32 {
    if fraction.is_nan() {
        return 0;
    }
    (fraction.clamp(0.0, 1.0) * register_count as f64).round() as u32
}

/// Raw register → loop current [mA].
pub fn register_to_milliamps(raw: i64, register_count: u32) -> f64 {
    let n = normalized(raw, register_count);
    round_to(CURRENT_MIN_MA + n * (CURRENT_MAX_MA - CURRENT_MIN_MA), 2)
}

/// Loop current [mA] → raw register.
pub fn milliamps_to_register(milliamps: f64, register_count: u32) -> u32 {
    fraction_to_register(
        current_fraction(milliamps, CURRENT_MIN_MA, CURRENT_MAX_MA),
        register_count,
    )
}

/// Raw register → percentage of full scale.
pub fn register_to_percentage(raw: i64, register_count: u32) -> f64 {
    round_to(normalized(raw, register_count) * 100.0, 1)
}

/// Percentage of full scale → raw register.
pub fn percentage_to_register(percentage: f64, register_count: u32) -> u32 {
    fraction_to_register(percentage / 100.0, register_count)
}

// ─── Length ─────────────────────────────────────────────────────────

/// Raw ruler register → millimetres over a linear stroke.
pub fn register_to_millimeters(raw: i64, register_count: u32, stroke_length_mm: f64) -> f64 {
    let ma = CURRENT_MIN_MA + normalized(raw, register_count) * (CURRENT_MAX_MA - CURRENT_MIN_MA);
    let fraction = current_fraction(ma, CURRENT_MIN_MA, CURRENT_MAX_MA);
    round_to(fraction * stroke_length_mm.max(0.0), 2)
}

/// Millimetres over a linear stroke → raw ruler register.
pub fn millimeters_to_register(mm: f64, register_count: u32, stroke_length_mm: f64) -> u32 {
    if stroke_length_mm <= 0.0 {
        return 0;
    }
    fraction_to_register(mm / stroke_length_mm, register_count)
}

/// Rotary encoder pulses → travelled distance [mm].
///
/// `distance = pulses × π × ball_diameter / pulses_per_revolution`.
/// Pulses are signed; a zero pulse count per revolution yields 0.
pub fn encoder_pulses_to_millimeters(
    pulses: i64,
    ball_diameter_mm: f64,
    pulses_per_revolution: u32,
) -> f64 {
    if pulses_per_revolution == 0 {
        return 0.0;
    }
    round_to(
        pulses as f64 * PI * ball_diameter_mm / pulses_per_revolution as f64,
        2,
    )
}

/// Travelled distance [mm] → rotary encoder pulses.
pub fn millimeters_to_encoder_pulses(
    mm: f64,
    ball_diameter_mm: f64,
    pulses_per_revolution: u32,
) -> i64 {
    let perimeter = PI * ball_diameter_mm;
    if perimeter <= 0.0 || mm.is_nan() {
        return 0;
    }
    (mm * pulses_per_revolution as f64 / perimeter).round() as i64
}

/// Microns → millimetres.
#[inline]
pub fn microns_to_millimeters(microns: f64) -> f64 {
    round_to(microns / 1000.0, 2)
}

/// Millimetres → microns.
#[inline]
pub fn millimeters_to_microns(mm: f64) -> f64 {
    round_to(mm * 1000.0, 0)
}

// ─── Pressure ───────────────────────────────────────────────────────

/// Pressure transmitter calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureScale {
    /// Pressure at the loop floor [bar].
    pub min_bar: f64,
    /// Pressure at the loop ceiling [bar].
    pub max_bar: f64,
    /// Loop floor [mA].
    #[serde(default = "default_min_ma")]
    pub min_ma: f64,
    /// Loop ceiling [mA].
    #[serde(default = "default_max_ma")]
    pub max_ma: f64,
}

fn default_min_ma() -> f64 {
    CURRENT_MIN_MA
}

fn default_max_ma() -> f64 {
    CURRENT_MAX_MA
}

impl PressureScale {
    /// Scale over the standard 4–20 mA loop.
    pub const fn new(min_bar: f64, max_bar: f64) -> Self {
        Self {
            min_bar,
            max_bar,
            min_ma: CURRENT_MIN_MA,
            max_ma: CURRENT_MAX_MA,
        }
    }
}

/// Loop current [mA] → pressure [bar].
pub fn milliamps_to_bar(milliamps: f64, scale: &PressureScale) -> f64 {
    let fraction = current_fraction(milliamps, scale.min_ma, scale.max_ma);
    round_to(scale.min_bar + fraction * (scale.max_bar - scale.min_bar), 2)
}

/// Pressure [bar] → loop current [mA].
pub fn bar_to_milliamps(bar: f64, scale: &PressureScale) -> f64 {
    let span = scale.max_bar - scale.min_bar;
    if span.abs() < f64::EPSILON || bar.is_nan() {
        return scale.min_ma;
    }
    let fraction = ((bar - scale.min_bar) / span).clamp(0.0, 1.0);
    round_to(scale.min_ma + fraction * (scale.max_ma - scale.min_ma), 2)
}

/// Raw register → pressure [bar], through the loop current.
pub fn register_to_bar(raw: i64, register_count: u32, scale: &PressureScale) -> f64 {
    let ma = CURRENT_MIN_MA + normalized(raw, register_count) * (CURRENT_MAX_MA - CURRENT_MIN_MA);
    milliamps_to_bar(ma, scale)
}

/// Pressure [bar] → raw register, through the loop current.
pub fn bar_to_register(bar: f64, register_count: u32, scale: &PressureScale) -> u32 {
    milliamps_to_register(bar_to_milliamps(bar, scale), register_count)
}

// ─── Climate & flow transmitters ────────────────────────────────────

#[inline]
fn milliamps_to_span(milliamps: f64, span: (f64, f64), decimals: u32) -> f64 {
    let fraction = current_fraction(milliamps, CURRENT_MIN_MA, CURRENT_MAX_MA);
    round_to(span.0 + fraction * (span.1 - span.0), decimals)
}

#[inline]
fn span_to_milliamps(value: f64, span: (f64, f64)) -> f64 {
    if value.is_nan() {
        return CURRENT_MIN_MA;
    }
    let fraction = ((value - span.0) / (span.1 - span.0)).clamp(0.0, 1.0);
    round_to(CURRENT_MIN_MA + fraction * (CURRENT_MAX_MA - CURRENT_MIN_MA), 2)
}

/// Loop current [mA] → oil temperature [°C].
pub fn milliamps_to_celsius(milliamps: f64) -> f64 {
    milliamps_to_span(milliamps, TEMPERATURE_SPAN_C, 1)
}

/// Oil temperature [°C] → loop current [mA].
pub fn celsius_to_milliamps(celsius: f64) -> f64 {
    span_to_milliamps(celsius, TEMPERATURE_SPAN_C)
}

/// Loop current [mA] → relative humidity [%RH].
pub fn milliamps_to_humidity(milliamps: f64) -> f64 {
    milliamps_to_span(milliamps, HUMIDITY_SPAN_PCT, 1)
}

/// Relative humidity [%RH] → loop current [mA].
pub fn humidity_to_milliamps(humidity: f64) -> f64 {
    span_to_milliamps(humidity, HUMIDITY_SPAN_PCT)
}

/// Loop current [mA] → flow rate [L/min].
pub fn milliamps_to_flow_rate(milliamps: f64) -> f64 {
    milliamps_to_span(milliamps, FLOW_SPAN_LPM, 2)
}

/// Flow rate [L/min] → loop current [mA].
pub fn flow_rate_to_milliamps(flow_lpm: f64) -> f64 {
    span_to_milliamps(flow_lpm, FLOW_SPAN_LPM)
}

// ─── Bending geometry ───────────────────────────────────────────────

/// A point in the bending plane [mm].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn distance(&self, other: &Point2) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Radius of the circle through three points.
///
/// Returns `None` when the points are colinear or coincident: no finite
/// circle passes through them.
pub fn circle_radius(a: Point2, b: Point2, c: Point2) -> Option<f64> {
    let ab = a.distance(&b);
    let bc = b.distance(&c);
    let ca = c.distance(&a);
    let longest = ab.max(bc).max(ca);
    if !longest.is_finite() || longest <= 0.0 {
        return None;
    }

    // Twice the signed triangle area.
    let cross = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    if cross.abs() <= COLINEAR_EPSILON * longest * longest {
        return None;
    }

    Some(round_to(ab * bc * ca / (2.0 * cross.abs()), 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn voltage_register_extremes() {
        assert_eq!(voltage_to_register(-10.0), -2048);
        assert_eq!(voltage_to_register(10.0), 2047);
        assert_eq!(voltage_to_register(0.0), 0);
        assert_eq!(voltage_to_register(25.0), 2047);
        assert_eq!(voltage_to_register(-25.0), -2048);
        assert_eq!(voltage_to_register(f64::NAN), 0);

        assert_eq!(register_to_voltage(-2048), -10.0);
        assert_eq!(register_to_voltage(0), 0.0);
        // 2047 / 204.8 = 9.9951 V, rounded to two decimals.
        assert_eq!(register_to_voltage(5000), 10.0);
    }

    #[test]
    fn milliamps_floor_and_ceiling() {
        assert_eq!(register_to_milliamps(0, 4095), 4.0);
        assert_eq!(register_to_milliamps(4095, 4095), 20.0);
        // Below zero is not physical: floor.
        assert_eq!(register_to_milliamps(-100, 4095), 4.0);
        // Overflow clamps to the ceiling.
        assert_eq!(register_to_milliamps(9000, 4095), 20.0);

        assert_eq!(milliamps_to_register(4.0, 4095), 0);
        assert_eq!(milliamps_to_register(20.0, 4095), 4095);
        assert_eq!(milliamps_to_register(2.0, 4095), 0);
        assert_eq!(milliamps_to_register(12.0, 1000), 500);
    }

    #[test]
    fn percentage_roundtrip() {
        assert_eq!(register_to_percentage(2048, 4096), 50.0);
        assert_eq!(percentage_to_register(50.0, 4096), 2048);
        assert_eq!(register_to_percentage(5000, 4096), 100.0);
        assert_eq!(percentage_to_register(-5.0, 4096), 0);
    }

    #[test]
    fn ruler_half_stroke() {
        let mm = register_to_millimeters(2048, 4095, 100.0);
        assert!((mm - 50.06).abs() < 0.1, "got {mm}");
        assert_eq!(register_to_millimeters(0, 4095, 100.0), 0.0);
        assert_eq!(register_to_millimeters(4095, 4095, 100.0), 100.0);
        assert_eq!(millimeters_to_register(100.0, 4095, 100.0), 4095);
        assert_eq!(millimeters_to_register(150.0, 4095, 100.0), 4095);
    }

    #[test]
    fn encoder_perimeter_distance() {
        let mm = encoder_pulses_to_millimeters(512, 220.0, 1024);
        assert!((mm - 345.58).abs() < 0.01, "got {mm}");
        assert_eq!(millimeters_to_encoder_pulses(345.58, 220.0, 1024), 512);
        assert_eq!(encoder_pulses_to_millimeters(512, 220.0, 0), 0.0);
        assert!(encoder_pulses_to_millimeters(-512, 220.0, 1024) < 0.0);
    }

    #[test]
    fn pressure_through_current_loop() {
        let scale = PressureScale::new(0.0, 250.0);
        let bar = register_to_bar(2048, 4095, &scale);
        assert!((bar - 125.15).abs() < 0.2, "got {bar}");
        assert_eq!(register_to_bar(0, 4095, &scale), 0.0);
        assert_eq!(register_to_bar(4095, 4095, &scale), 250.0);
        assert_eq!(bar_to_register(250.0, 4095, &scale), 4095);
        assert_eq!(bar_to_milliamps(125.0, &scale), 12.0);
        assert_eq!(milliamps_to_bar(3.0, &scale), 0.0);
    }

    #[test]
    fn transmitter_slopes_are_distinct() {
        assert_eq!(milliamps_to_celsius(12.0), 75.0);
        assert_eq!(milliamps_to_humidity(12.0), 50.0);
        assert_eq!(milliamps_to_flow_rate(12.0), 150.0);
        assert_eq!(celsius_to_milliamps(150.0), 20.0);
        assert_eq!(humidity_to_milliamps(0.0), 4.0);
        assert_eq!(flow_rate_to_milliamps(75.0), 8.0);
        assert_eq!(milliamps_to_celsius(0.0), 0.0);
    }

    #[test]
    fn micron_millimeter() {
        assert_eq!(microns_to_millimeters(1500.0), 1.5);
        assert_eq!(microns_to_millimeters(1234.0), 1.23);
        assert_eq!(millimeters_to_microns(0.25), 250.0);
    }

    #[test]
    fn angles() {
        assert!((degrees_to_radians(180.0) - PI).abs() < 1e-12);
        assert!((radians_to_degrees(PI / 2.0) - 90.0).abs() < 1e-12);
    }

    #[test]
    fn radius_of_unit_circle() {
        let r = circle_radius(
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(2.0, 0.0),
        );
        assert_eq!(r, Some(1.0));
    }

    #[test]
    fn radius_undefined_for_colinear_points() {
        let a = Point2::new(0.0, 0.0);
        let b = Point2::new(1.0, 1.0);
        let c = Point2::new(2.0, 2.0);
        assert_eq!(circle_radius(a, b, c), None);
        assert_eq!(circle_radius(a, a, c), None);
        assert_eq!(circle_radius(a, a, a), None);
    }

    #[test]
    fn radius_of_shallow_arc() {
        // Chord 1000 mm, sagitta 10 mm → R = (c²/4 + s²) / 2s = 12505 mm.
        let r = circle_radius(
            Point2::new(-500.0, 0.0),
            Point2::new(0.0, 10.0),
            Point2::new(500.0, 0.0),
        )
        .unwrap();
        assert!((r - 12505.0).abs() < 0.01, "got {r}");
    }

    proptest! {
        #[test]
        fn voltage_roundtrip_within_tenth(v in -10.0f64..=10.0) {
            let back = register_to_voltage(voltage_to_register(v) as i32);
            prop_assert!((back - v).abs() <= 0.1);
        }

        #[test]
        fn millimeters_monotonic(a in 0i64..=4095, b in 0i64..=4095) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(
                register_to_millimeters(lo, 4095, 300.0) <= register_to_millimeters(hi, 4095, 300.0)
            );
        }

        #[test]
        fn milliamps_always_in_loop_range(raw in any::<i32>()) {
            let ma = register_to_milliamps(raw as i64, 4095);
            prop_assert!((CURRENT_MIN_MA..=CURRENT_MAX_MA).contains(&ma));
        }
    }
}
