//! Machine facade.
//!
//! [`Machine`] is the surface offered to the recipe orchestrator and API
//! layers: connection control, status, moves, jogs, stops, reference
//! setting and event subscriptions. It owns one [`AxisSlot`] per configured
//! axis and shares a single fieldbus transport between all of them.
//!
//! ## Invariants
//!
//! | Rule | Enforcement |
//! |------|-------------|
//! | One supervising task per axis | a new move or jog cancels and awaits the previous move first |
//! | No motion under a critical safety flag | fresh safety read before every move / jog; running moves watch the flags |
//! | Fail safe | a newly raised critical flag stops every axis from the status loop |
//! | Jog stays in range | status refresh stops a jog that reached its travel limit |
//!
//! The transports serialize requests themselves, so moves on different
//! axes run concurrently.

use crate::axis::{AxisDrive, AxisPositionModel};
use crate::error::ControlError;
use crate::positioning::{
    CancelHandle, FaultReason, MoveOutcome, PrecisionPositioningController, cancel_pair,
};
use crate::safety::{SafetyMonitor, ensure_motion_allowed};
use crate::status::{RawStatus, StatusReader};
use crate::sync::{StatusPublisher, StatusSource, StatusSyncLoop, SyncHandle};
use async_trait::async_trait;
use bend_common::axis::{AxisCalibration, AxisId, AxisState, Direction, Motion};
use bend_common::config::{MachineConfig, SpeedProfile};
use bend_common::convert::round_to;
use bend_common::event::MachineEvent;
use bend_common::fieldbus::{FieldbusError, FieldbusEvent, FieldbusTransport};
use bend_common::status::{ConnectionState, MachineStatusSnapshot, SafetyFlags};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// A move running in its own task.
struct ActiveMove {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

/// Everything the machine keeps per axis.
struct AxisSlot {
    model: RwLock<AxisPositionModel>,
    drive: AxisDrive,
    state: Arc<Mutex<AxisState>>,
    active: tokio::sync::Mutex<Option<ActiveMove>>,
    /// Direction of a running jog
    jog: Mutex<Option<Direction>>,
    /// Previous (time, position) sample for speed estimation
    last_sample: Mutex<Option<(Instant, f64)>>,
}

impl AxisSlot {
    fn new(calibration: AxisCalibration, transport: Arc<dyn FieldbusTransport>) -> Self {
        let id = calibration.id;
        let calibration = Arc::new(calibration);
        Self {
            model: RwLock::new(AxisPositionModel::new(Arc::clone(&calibration))),
            drive: AxisDrive::new(calibration, transport),
            state: Arc::new(Mutex::new(AxisState::new(id))),
            active: tokio::sync::Mutex::new(None),
            jog: Mutex::new(None),
            last_sample: Mutex::new(None),
        }
    }

    fn id(&self) -> AxisId {
        self.drive.calibration().id
    }

    /// Update position, raw value, output readback and speed from a poll.
    fn refresh(&self, reader: &StatusReader, raw: &RawStatus, now: Instant) -> AxisState {
        let (reading, position) = {
            let model = self.model.read();
            let reading = reader.axis(&model, raw);
            (reading, model.position(reading.raw))
        };

        let speed = {
            let mut last = self.last_sample.lock();
            let speed = match *last {
                Some((at, previous)) => {
                    let dt = now.duration_since(at).as_secs_f64();
                    if dt > 0.0 {
                        round_to((position - previous) / dt, 2)
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            *last = Some((now, position));
            speed
        };

        let mut state = self.state.lock();
        state.current_position_mm = position;
        state.raw_register = reading.raw;
        state.current_voltage = reading.voltage;
        state.motion = reading.motion;
        state.is_moving = reading.motion != Motion::Closed;
        state.speed_mmps = speed;
        state.clone()
    }
}

/// Stop a running move and wait until its task has released the outputs.
async fn cancel_active(axis: AxisId, active: &mut Option<ActiveMove>) {
    if let Some(previous) = active.take() {
        previous.cancel.cancel();
        if let Err(e) = previous.task.await {
            error!(%axis, error = %e, "move task ended abnormally");
        }
    }
}

/// The motion core of one bending machine.
pub struct Machine {
    config: Arc<MachineConfig>,
    transport: Arc<dyn FieldbusTransport>,
    axes: BTreeMap<AxisId, AxisSlot>,
    reader: StatusReader,
    publisher: StatusPublisher,
    safety: watch::Sender<SafetyFlags>,
    monitor: SafetyMonitor,
}

impl Machine {
    pub fn new(config: Arc<MachineConfig>, transport: Arc<dyn FieldbusTransport>) -> Self {
        let axes = config
            .axes
            .iter()
            .map(|cal| (cal.id, AxisSlot::new(cal.clone(), Arc::clone(&transport))))
            .collect();
        let (safety, _) = watch::channel(SafetyFlags::empty());
        Self {
            reader: StatusReader::new(Arc::clone(&config)),
            config,
            transport,
            axes,
            publisher: StatusPublisher::new(),
            safety,
            monitor: SafetyMonitor::new(),
        }
    }

    pub fn config(&self) -> &Arc<MachineConfig> {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn FieldbusTransport> {
        &self.transport
    }

    /// Configured axes in status order.
    pub fn axis_ids(&self) -> impl Iterator<Item = AxisId> + '_ {
        self.axes.keys().copied()
    }

    fn slot(&self, axis: AxisId) -> Result<&AxisSlot, ControlError> {
        self.axes
            .get(&axis)
            .ok_or(ControlError::AxisNotConfigured(axis))
    }

    // ─── Connection ─────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), ControlError> {
        self.transport.connect().await?;
        Ok(())
    }

    /// Stop every axis, then close the connection.
    pub async fn disconnect(&self) -> Result<(), ControlError> {
        if let Err(e) = self.stop_all().await {
            warn!(error = %e, "stop before disconnect incomplete");
        }
        self.transport.disconnect().await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    // ─── Status & subscriptions ─────────────────────────────────────

    /// Latest published snapshot.
    pub fn get_status(&self) -> Arc<MachineStatusSnapshot> {
        self.publisher.latest()
    }

    /// Live state of one axis.
    pub fn axis_state(&self, axis: AxisId) -> Result<AxisState, ControlError> {
        Ok(self.slot(axis)?.state.lock().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.publisher.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<Arc<MachineStatusSnapshot>> {
        self.publisher.watch()
    }

    pub fn subscribe_fieldbus(&self) -> broadcast::Receiver<FieldbusEvent> {
        self.transport.subscribe()
    }

    /// Start the background status loop.
    pub fn start_sync(self: &Arc<Self>) -> SyncHandle {
        StatusSyncLoop::new(
            self.config.sync.clone(),
            Arc::clone(self),
            self.publisher.clone(),
        )
        .spawn()
    }

    /// Read the safety chain now and share the result with running moves.
    pub async fn refresh_safety(&self) -> Result<SafetyFlags, ControlError> {
        let flags = self.reader.read_safety(self.transport.as_ref()).await?;
        self.safety.send_replace(flags);
        Ok(flags)
    }

    // ─── Motion ─────────────────────────────────────────────────────

    /// Move `axis` to `target` [mm] and wait for the outcome.
    ///
    /// `profile` overrides the configured speed profile for this move.
    pub async fn move_axis(
        &self,
        axis: AxisId,
        target: f64,
        profile: Option<SpeedProfile>,
    ) -> Result<MoveOutcome, ControlError> {
        let outcome = self.start_move(axis, target, profile).await?;
        Ok(outcome
            .await
            .unwrap_or(MoveOutcome::Faulted(FaultReason::Cancelled)))
    }

    /// Start a move and return as soon as it runs.
    ///
    /// The move keeps running (and stays supervised) if the receiver is dropped.
    pub async fn start_move(
        &self,
        axis: AxisId,
        target: f64,
        profile: Option<SpeedProfile>,
    ) -> Result<oneshot::Receiver<MoveOutcome>, ControlError> {
        let slot = self.slot(axis)?;
        if let Some(profile) = &profile {
            profile
                .validate()
                .map_err(|e| ControlError::InvalidProfile(e.to_string()))?;
        }

        let model = slot.model.read().clone();
        let calibration = model.calibration();
        if !model.in_range(target) {
            let direction = if target > calibration.max_position() {
                Direction::Forward
            } else {
                Direction::Backward
            };
            return Err(ControlError::LimitReached { axis, direction });
        }
        let target = target.clamp(calibration.min_position(), calibration.max_position());

        ensure_motion_allowed(self.refresh_safety().await?)?;

        let mut active = slot.active.lock().await;
        cancel_active(axis, &mut active).await;
        *slot.jog.lock() = None;

        let mut controller = PrecisionPositioningController::new(
            model,
            slot.drive.clone(),
            self.config.positioning.clone(),
        )
        .with_state(Arc::clone(&slot.state))
        .with_safety(self.safety.subscribe())
        .with_events(self.publisher.events().clone());
        if let Some(profile) = profile {
            controller = controller.with_profile(profile);
        }

        let (cancel, signal) = cancel_pair();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let outcome = controller.run(target, signal).await;
            let _ = tx.send(outcome);
        });
        *active = Some(ActiveMove { cancel, task });
        info!(%axis, target, "move dispatched");
        Ok(rx)
    }

    /// Drive `axis` open-loop in `direction` at `speed_percent` until stopped.
    ///
    /// Returns the commanded voltage (0.0 for coil axes).
    pub async fn jog_axis(
        &self,
        axis: AxisId,
        direction: Direction,
        speed_percent: f64,
    ) -> Result<f64, ControlError> {
        if !(speed_percent > 0.0 && speed_percent <= 100.0) {
            return Err(ControlError::InvalidSpeed(speed_percent));
        }
        let slot = self.slot(axis)?;
        ensure_motion_allowed(self.refresh_safety().await?)?;

        let raw = slot.drive.read_raw().await?;
        let position = slot.model.read().position(raw);
        if !slot.model.read().can_move(direction, position) {
            return Err(ControlError::LimitReached { axis, direction });
        }

        let mut active = slot.active.lock().await;
        cancel_active(axis, &mut active).await;

        let volts = slot.drive.drive(direction, speed_percent).await?;
        *slot.jog.lock() = Some(direction);
        drop(active);

        let motion = Motion::from(direction);
        {
            let mut state = slot.state.lock();
            state.current_position_mm = position;
            state.raw_register = raw;
            state.current_voltage = volts;
            state.motion = motion;
            state.is_moving = true;
            state.is_at_target = false;
        }
        self.publisher
            .emit(MachineEvent::AxisMotionChanged { axis, motion });
        info!(%axis, ?direction, speed_percent, "jog started");
        Ok(volts)
    }

    /// Cancel any move or jog on `axis` and release its outputs.
    pub async fn stop_axis(&self, axis: AxisId) -> Result<(), ControlError> {
        self.stop_slot(self.slot(axis)?).await
    }

    /// Stop every axis. All axes are attempted; the first error is returned.
    pub async fn stop_all(&self) -> Result<(), ControlError> {
        let mut first = None;
        for slot in self.axes.values() {
            if let Err(e) = self.stop_slot(slot).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn stop_slot(&self, slot: &AxisSlot) -> Result<(), ControlError> {
        let axis = slot.id();
        let mut active = slot.active.lock().await;
        cancel_active(axis, &mut active).await;
        *slot.jog.lock() = None;

        let result = slot.drive.stop().await;
        drop(active);

        let was = {
            let mut state = slot.state.lock();
            let was = state.motion;
            state.motion = Motion::Closed;
            state.is_moving = false;
            state.current_voltage = 0.0;
            was
        };
        if was != Motion::Closed {
            self.publisher.emit(MachineEvent::AxisMotionChanged {
                axis,
                motion: Motion::Closed,
            });
            info!(%axis, "axis stopped");
        }
        result.map_err(ControlError::from)
    }

    /// Make the current position of a signed-mode axis its new zero.
    ///
    /// Returns the new reference [mm, absolute]. A move already running keeps
    /// the reference it started with.
    pub async fn set_reference(&self, axis: AxisId) -> Result<f64, ControlError> {
        let slot = self.slot(axis)?;
        if !slot.drive.calibration().ruler.is_signed() {
            return Err(ControlError::RulerModeMismatch {
                axis,
                expected: "signed_relative",
            });
        }
        let raw = slot.drive.read_raw().await?;
        let (reference, position) = {
            let mut model = slot.model.write();
            let reference = model.set_reference(raw)?;
            (reference, model.position(raw))
        };
        {
            let mut state = slot.state.lock();
            state.current_position_mm = position;
            state.raw_register = raw;
        }
        info!(%axis, raw, reference, "reference set");
        Ok(reference)
    }

    // ─── Supervision ────────────────────────────────────────────────

    async fn supervise(&self, snapshot: &MachineStatusSnapshot) {
        let edges = self.monitor.observe(snapshot.safety);
        if let Some(flags) = edges.violation {
            error!(%flags, "safety violation, stopping all axes");
            if let Err(e) = self.stop_all().await {
                error!(error = %e, "emergency stop incomplete");
            }
            self.publisher.emit(MachineEvent::SafetyViolation(flags));
        }
        if let Some(flags) = edges.alarm {
            warn!(%flags, "alarm raised");
            self.publisher.emit(MachineEvent::AlarmRaised(flags));
        }

        for slot in self.axes.values() {
            let Some(direction) = *slot.jog.lock() else {
                continue;
            };
            let position = slot.state.lock().current_position_mm;
            let can_move = slot.model.read().can_move(direction, position);
            if !can_move {
                info!(axis = %slot.id(), position, "jog reached travel limit");
                if let Err(e) = self.stop_slot(slot).await {
                    warn!(axis = %slot.id(), error = %e, "failed to stop jog at limit");
                }
            }
        }
    }
}

#[async_trait]
impl StatusSource for Machine {
    async fn poll_status(&self) -> Result<MachineStatusSnapshot, FieldbusError> {
        let raw = self.reader.acquire(self.transport.as_ref()).await?;
        let safety = self.reader.safety(&raw);
        self.safety.send_replace(safety);

        let now = Instant::now();
        let axes = self
            .axes
            .values()
            .map(|slot| slot.refresh(&self.reader, &raw, now))
            .collect();

        Ok(MachineStatusSnapshot {
            sequence: 0,
            timestamp_us: 0,
            axes,
            safety,
            motors: self.reader.motors(&raw),
            valves: self.reader.valves(&raw),
            sensors: self.reader.sensors(&raw),
            connection: ConnectionState::Connected,
        })
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn reconnect(&self) -> Result<(), FieldbusError> {
        self.transport.connect().await
    }

    async fn on_snapshot(&self, snapshot: &MachineStatusSnapshot) {
        self.supervise(snapshot).await;
    }
}
