//! Precision positioning.
//!
//! Closed-loop move of one axis to an absolute target using only ruler
//! feedback and a decelerating multi-stage speed profile.
//!
//! ## Phases
//!
//! ```text
//! Idle ──► Seeking(0) ──► Seeking(1) ──► … ──► Approaching ──► Settled
//!   │                │                                  │
//!   └──► Settled     └──► Settled (wide tolerance)      └──► Faulted (any phase)
//! ```
//!
//! | Phase       | Output                          | Sampling                    |
//! |-------------|---------------------------------|-----------------------------|
//! | Seeking(n)  | stage n speed toward the target | `sample_period_ms`          |
//! | Approaching | last stage speed / released     | `approach_sample_period_ms` |
//! | Settled     | released                        | -                           |
//! | Faulted     | released                        | -                           |
//!
//! Stage `n` is entered once the travelled share of the initial distance
//! reaches `stages[n-1].until_fraction`; stages never go back. Direction is
//! recomputed from every sample, so a small overshoot is corrected inside the
//! same move. Arrival needs `settle_samples` consecutive in-tolerance samples,
//! counted in whatever phase the move is in: reaching the tolerance band
//! releases the output but does not advance the stage, and leaving it again
//! resumes at the current stage speed.
//!
//! ## Faults
//!
//! | Reason          | Trigger                                                          |
//! |-----------------|------------------------------------------------------------------|
//! | SensorFreeze    | raw unchanged for `max_stuck_samples` samples while driving      |
//! | Timeout         | `move_timeout_ms` elapsed                                        |
//! | Drift           | remaining distance grew by more than `drift_tolerance_mm` within a stage |
//! | SafetyInterlock | a critical safety flag was raised                                |
//! | Cancelled       | the move's cancel handle fired                                   |
//! | Transport       | a fieldbus read or write failed                                  |
//!
//! Outputs are released before any terminal outcome is returned.

use crate::axis::{AxisDrive, AxisPositionModel};
use bend_common::axis::{AxisId, AxisState, Direction, Motion};
use bend_common::config::{PositioningConfig, SpeedProfile};
use bend_common::event::{MachineEvent, MovePhase, PositioningEvent};
use bend_common::fieldbus::FieldbusError;
use bend_common::status::SafetyFlags;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{info, trace, warn};

// ─── Cancellation ───────────────────────────────────────────────────

/// Owner side of a move's cancellation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Controller side of a move's cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the value readable after the sender is gone.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pending forever if the
    /// handle was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        let closed = self.rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Create a connected cancel handle / signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

// ─── Outcome ────────────────────────────────────────────────────────

/// Why a move ended without settling.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultReason {
    /// Raw ruler value stuck while output was commanded.
    SensorFreeze { raw: i32, samples: u32 },
    Timeout { elapsed: Duration },
    /// Remaining distance grew beyond the drift tolerance.
    Drift { drift_mm: f64 },
    SafetyInterlock(SafetyFlags),
    Cancelled,
    Transport(FieldbusError),
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultReason::SensorFreeze { raw, samples } => {
                write!(f, "sensor frozen at raw {raw} for {samples} samples")
            }
            FaultReason::Timeout { elapsed } => write!(f, "move timed out after {elapsed:?}"),
            FaultReason::Drift { drift_mm } => write!(f, "drift of {drift_mm:.2} mm"),
            FaultReason::SafetyInterlock(flags) => write!(f, "safety interlock ({flags})"),
            FaultReason::Cancelled => f.write_str("cancelled"),
            FaultReason::Transport(e) => write!(f, "fieldbus: {e}"),
        }
    }
}

/// Terminal result of a move.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    Settled { position_mm: f64, elapsed: Duration },
    Faulted(FaultReason),
}

impl MoveOutcome {
    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(self, MoveOutcome::Settled { .. })
    }
}

// ─── Controller ─────────────────────────────────────────────────────

/// Runs one positioning move.
pub struct PrecisionPositioningController {
    model: AxisPositionModel,
    drive: AxisDrive,
    config: PositioningConfig,
    profile: SpeedProfile,
    state: Option<Arc<Mutex<AxisState>>>,
    safety: Option<watch::Receiver<SafetyFlags>>,
    events: Option<broadcast::Sender<MachineEvent>>,
    phase: MovePhase,
    motion: Motion,
}

impl PrecisionPositioningController {
    pub fn new(model: AxisPositionModel, drive: AxisDrive, config: PositioningConfig) -> Self {
        let profile = config.stages.clone();
        Self {
            model,
            drive,
            config,
            profile,
            state: None,
            safety: None,
            events: None,
            phase: MovePhase::Idle,
            motion: Motion::Closed,
        }
    }

    /// Use `profile` instead of the configured one for this move.
    pub fn with_profile(mut self, profile: SpeedProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Mirror progress into the shared axis state.
    pub fn with_state(mut self, state: Arc<Mutex<AxisState>>) -> Self {
        self.state = Some(state);
        self
    }

    /// Abort when a critical safety flag appears on `safety`.
    pub fn with_safety(mut self, safety: watch::Receiver<SafetyFlags>) -> Self {
        self.safety = Some(safety);
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<MachineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    #[inline]
    pub fn phase(&self) -> MovePhase {
        self.phase
    }

    #[inline]
    fn axis(&self) -> AxisId {
        self.model.id()
    }

    /// Drive the axis to `target` [mm].
    pub async fn run(&mut self, target: f64, mut cancel: CancelSignal) -> MoveOutcome {
        let axis = self.axis();
        let started = Instant::now();
        let deadline = started + self.config.move_timeout();
        let tolerance = self.model.tolerance();
        let last_stage = self.profile.last_stage();
        self.phase = MovePhase::Idle;
        self.motion = Motion::Closed;

        let mut raw = match self.drive.read_raw().await {
            Ok(raw) => raw,
            Err(e) => return self.abort(FaultReason::Transport(e), f64::NAN, 0.0).await,
        };
        let mut position = self.model.position(raw);
        let total = (target - position).abs();
        self.update_state(|s| {
            s.target_position_mm = target;
            s.current_position_mm = position;
            s.raw_register = raw;
            s.is_at_target = false;
        });

        info!(
            %axis,
            from = position,
            to = target,
            target_raw = self.model.ruler_from_position(target),
            "move started"
        );

        if total <= tolerance {
            return self.settle(position, 1.0, started.elapsed());
        }

        let mut stage = 0usize;
        let mut driving: Option<(Direction, usize)> = None;
        let mut best_remaining = total;
        let mut in_tolerance = 0u32;
        let mut stuck = 0u32;

        loop {
            if let Some(flags) = self.blocking_flags() {
                let fraction = travelled(total, target - position);
                return self
                    .abort(FaultReason::SafetyInterlock(flags), position, fraction)
                    .await;
            }

            let remaining = target - position;
            let fraction = travelled(total, remaining);

            if remaining.abs() <= tolerance {
                if driving.take().is_some() {
                    if let Err(e) = self.drive.stop().await {
                        return self.abort(FaultReason::Transport(e), position, fraction).await;
                    }
                    self.set_motion(Motion::Closed, 0.0);
                }
                in_tolerance += 1;
                if in_tolerance >= self.config.settle_samples {
                    return self.settle(position, fraction, started.elapsed());
                }
            } else {
                in_tolerance = 0;

                let wanted = stage.max(self.profile.stage_for(fraction));
                let next = if wanted >= last_stage {
                    MovePhase::Approaching
                } else {
                    MovePhase::Seeking { stage: wanted }
                };
                if wanted != stage {
                    best_remaining = remaining.abs();
                    stage = wanted;
                }
                if self.phase != next {
                    self.transition(next, position, fraction);
                }

                let drift = remaining.abs() - best_remaining;
                if drift > self.config.drift_tolerance_mm {
                    return self
                        .abort(FaultReason::Drift { drift_mm: drift }, position, fraction)
                        .await;
                }
                best_remaining = best_remaining.min(remaining.abs());

                let direction = Direction::toward(remaining);
                if driving != Some((direction, stage)) {
                    let speed = self.profile.speed_percent(stage);
                    match self.drive.drive(direction, speed).await {
                        Ok(volts) => self.set_motion(direction.into(), volts),
                        Err(e) => {
                            return self.abort(FaultReason::Transport(e), position, fraction).await;
                        }
                    }
                    driving = Some((direction, stage));
                }
            }

            let period = if self.phase == MovePhase::Approaching {
                self.config.approach_sample_period()
            } else {
                self.config.sample_period()
            };
            let wake = (Instant::now() + period).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.abort(FaultReason::Cancelled, position, fraction).await;
                }
                _ = sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                let elapsed = started.elapsed();
                return self
                    .abort(FaultReason::Timeout { elapsed }, position, fraction)
                    .await;
            }

            let sample = match self.drive.read_raw().await {
                Ok(sample) => sample,
                Err(e) => return self.abort(FaultReason::Transport(e), position, fraction).await,
            };

            if driving.is_some() && sample == raw {
                stuck += 1;
                if stuck >= self.config.max_stuck_samples {
                    let reason = FaultReason::SensorFreeze {
                        raw: sample,
                        samples: stuck,
                    };
                    return self.abort(reason, position, fraction).await;
                }
            } else {
                stuck = 0;
            }

            raw = sample;
            position = self.model.position(raw);
            self.update_state(|s| {
                s.current_position_mm = position;
                s.raw_register = raw;
            });
            trace!(%axis, raw, position, remaining = target - position, stuck, "sample");
        }
    }

    // ─── Helpers ────────────────────────────────────────────────────

    fn blocking_flags(&self) -> Option<SafetyFlags> {
        let flags = *self.safety.as_ref()?.borrow();
        flags.blocks_motion().then(|| flags.critical())
    }

    fn update_state(&self, f: impl FnOnce(&mut AxisState)) {
        if let Some(state) = &self.state {
            f(&mut state.lock());
        }
    }

    fn emit(&self, event: MachineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn set_motion(&mut self, motion: Motion, volts: f64) {
        self.update_state(|s| {
            s.motion = motion;
            s.is_moving = motion != Motion::Closed;
            s.current_voltage = volts;
        });
        if self.motion != motion {
            self.motion = motion;
            self.emit(MachineEvent::AxisMotionChanged {
                axis: self.axis(),
                motion,
            });
        }
    }

    fn transition(&mut self, phase: MovePhase, position: f64, fraction: f64) {
        let axis = self.axis();
        info!(%axis, from = ?self.phase, to = ?phase, position, fraction, "move phase");
        self.phase = phase;
        self.emit(MachineEvent::Positioning(PositioningEvent {
            axis,
            phase,
            position_mm: position,
            travelled_fraction: fraction,
        }));
    }

    fn settle(&mut self, position: f64, fraction: f64, elapsed: Duration) -> MoveOutcome {
        self.update_state(|s| {
            s.is_at_target = true;
            s.is_moving = false;
            s.motion = Motion::Closed;
            s.current_voltage = 0.0;
        });
        self.transition(MovePhase::Settled, position, fraction);
        info!(axis = %self.axis(), position, ?elapsed, "move settled");
        MoveOutcome::Settled {
            position_mm: position,
            elapsed,
        }
    }

    async fn abort(&mut self, reason: FaultReason, position: f64, fraction: f64) -> MoveOutcome {
        let axis = self.axis();
        if let Err(e) = self.drive.stop().await {
            warn!(%axis, error = %e, "failed to release outputs after fault");
        }
        self.set_motion(Motion::Closed, 0.0);
        self.transition(MovePhase::Faulted, position, fraction);
        warn!(%axis, %reason, "move faulted");
        MoveOutcome::Faulted(reason)
    }
}

/// Share of `total` already covered when `remaining` is left.
fn travelled(total: f64, remaining: f64) -> f64 {
    if total <= 0.0 {
        return 1.0;
    }
    (1.0 - remaining.abs() / total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bend_common::axis::{AxisCalibration, RulerMode};
    use bend_hal::SimulatedTransport;
    use bend_common::fieldbus::FieldbusTransport;

    async fn rig() -> (Arc<SimulatedTransport>, PrecisionPositioningController) {
        let mut cal = AxisCalibration::linear(AxisId::CenterPiston, 200.0, 2, 2);
        cal.position_tolerance_mm = 0.3;
        let cal = Arc::new(cal);
        let sim = Arc::new(SimulatedTransport::new());
        sim.add_axis((*cal).clone());
        sim.connect().await.unwrap();
        let controller = PrecisionPositioningController::new(
            AxisPositionModel::new(cal.clone()),
            AxisDrive::new(cal, sim.clone()),
            PositioningConfig::default(),
        );
        (sim, controller)
    }

    #[test]
    fn travelled_fraction_is_clamped() {
        assert_eq!(travelled(100.0, 100.0), 0.0);
        assert_eq!(travelled(100.0, 25.0), 0.75);
        assert_eq!(travelled(100.0, -25.0), 0.75);
        assert_eq!(travelled(100.0, 150.0), 0.0);
        assert_eq!(travelled(0.0, 0.0), 1.0);
    }

    #[test]
    fn never_signal_is_not_cancelled() {
        assert!(!CancelSignal::never().is_cancelled());
        let (handle, signal) = cancel_pair();
        handle.cancel();
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn settles_on_target() {
        let (sim, mut controller) = rig().await;
        let outcome = controller.run(100.0, CancelSignal::never()).await;

        let MoveOutcome::Settled { position_mm, .. } = outcome else {
            panic!("expected settle, got {outcome:?}");
        };
        assert!((position_mm - 100.0).abs() <= 0.3);
        assert_eq!(controller.phase(), MovePhase::Settled);
        assert_eq!(sim.holding(2), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn already_in_tolerance_settles_without_motion() {
        let (sim, mut controller) = rig().await;
        let before = sim.request_count();
        let outcome = controller.run(0.2, CancelSignal::never()).await;
        assert!(outcome.is_settled());
        // Only the initial ruler read went out.
        assert_eq!(sim.request_count(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backward_move_on_bounded_axis() {
        let mut cal = AxisCalibration::linear(AxisId::LeftPiston, 300.0, 0, 0);
        cal.ruler = RulerMode::BoundedRange {
            min_register: 210,
            max_register: 3890,
        };
        let cal = Arc::new(cal);
        let sim = Arc::new(SimulatedTransport::new());
        sim.add_axis((*cal).clone());
        sim.set_raw(AxisId::LeftPiston, 3000);
        sim.connect().await.unwrap();

        let model = AxisPositionModel::new(cal.clone());
        let mut controller = PrecisionPositioningController::new(
            model.clone(),
            AxisDrive::new(cal, sim.clone()),
            PositioningConfig::default(),
        );
        let outcome = controller.run(40.0, CancelSignal::never()).await;
        assert!(outcome.is_settled(), "{outcome:?}");
        let raw = sim.raw(AxisId::LeftPiston).unwrap();
        assert!((model.position(raw) - 40.0).abs() <= 0.5);
    }
}
