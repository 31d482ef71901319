//! Safety gating.
//!
//! Critical safety inputs (emergency stop, thermal relays, phase sequence)
//! block every new motion command regardless of who issues it. The
//! [`SafetyMonitor`] turns successive flag readings into edge events so the
//! machine reacts once per newly raised input.

use crate::error::ControlError;
use bend_common::status::SafetyFlags;
use parking_lot::Mutex;

/// Refuse motion while any critical flag is set.
pub fn ensure_motion_allowed(flags: SafetyFlags) -> Result<(), ControlError> {
    if flags.blocks_motion() {
        Err(ControlError::SafetyInterlock(flags.critical()))
    } else {
        Ok(())
    }
}

/// Edges found by one [`SafetyMonitor::observe`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafetyEdges {
    /// Critical flags raised since the previous observation.
    pub violation: Option<SafetyFlags>,
    /// Set when the alarm input went active.
    pub alarm: Option<SafetyFlags>,
}

/// Rising-edge detector over safety flag readings.
#[derive(Debug, Default)]
pub struct SafetyMonitor {
    last: Mutex<SafetyFlags>,
}

impl SafetyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `current` and report newly raised flags.
    pub fn observe(&self, current: SafetyFlags) -> SafetyEdges {
        let previous = std::mem::replace(&mut *self.last.lock(), current);
        let raised = current.difference(previous);

        SafetyEdges {
            violation: raised.blocks_motion().then(|| current.critical()),
            alarm: raised.contains(SafetyFlags::ALARM).then_some(current),
        }
    }

    pub fn last(&self) -> SafetyFlags {
        *self.last.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_flags_block_motion() {
        assert!(ensure_motion_allowed(SafetyFlags::empty()).is_ok());
        assert!(ensure_motion_allowed(SafetyFlags::ALARM).is_ok());
        assert_eq!(
            ensure_motion_allowed(SafetyFlags::EMERGENCY_STOP | SafetyFlags::ALARM),
            Err(ControlError::SafetyInterlock(SafetyFlags::EMERGENCY_STOP))
        );
    }

    #[test]
    fn monitor_reports_rising_edges_once() {
        let monitor = SafetyMonitor::new();

        let edges = monitor.observe(SafetyFlags::THERMAL_PUMP_MOTOR);
        assert_eq!(edges.violation, Some(SafetyFlags::THERMAL_PUMP_MOTOR));
        assert_eq!(edges.alarm, None);

        // Still set: no new edge.
        assert_eq!(
            monitor.observe(SafetyFlags::THERMAL_PUMP_MOTOR),
            SafetyEdges::default()
        );

        let edges = monitor.observe(SafetyFlags::THERMAL_PUMP_MOTOR | SafetyFlags::ALARM);
        assert_eq!(edges.violation, None);
        assert!(edges.alarm.is_some());

        // Cleared then raised again.
        monitor.observe(SafetyFlags::empty());
        let edges = monitor.observe(SafetyFlags::EMERGENCY_STOP);
        assert_eq!(edges.violation, Some(SafetyFlags::EMERGENCY_STOP));
        assert_eq!(monitor.last(), SafetyFlags::EMERGENCY_STOP);
    }
}
