//! Integration test: precision positioning against the simulated slave.
//!
//! Covers the fault paths of a move (sensor freeze, timeout, drift, safety,
//! cancellation) and the ordering of stage transitions.

use bend_common::axis::{Actuation, AxisCalibration, AxisId};
use bend_common::config::{PositioningConfig, SpeedProfile};
use bend_common::event::{MachineEvent, MovePhase};
use bend_common::fieldbus::FieldbusTransport;
use bend_common::status::SafetyFlags;
use bend_control_unit::{
    AxisDrive, AxisPositionModel, CancelSignal, FaultReason, MoveOutcome,
    PrecisionPositioningController, cancel_pair,
};
use bend_hal::SimulatedTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, sleep};

// ── Helpers ─────────────────────────────────────────────────────────

fn center_piston() -> AxisCalibration {
    let mut cal = AxisCalibration::linear(AxisId::CenterPiston, 200.0, 2, 2);
    cal.position_tolerance_mm = 0.3;
    cal
}

fn left_clamp() -> AxisCalibration {
    let mut cal = AxisCalibration::linear(AxisId::LeftClamp, 80.0, 3, 0);
    cal.position_tolerance_mm = 1.0;
    cal.actuation = Actuation::Coil {
        forward_coil: 10,
        backward_coil: 11,
    };
    cal
}

async fn rig(
    calibration: AxisCalibration,
    config: PositioningConfig,
) -> (Arc<SimulatedTransport>, PrecisionPositioningController) {
    let cal = Arc::new(calibration);
    let sim = Arc::new(SimulatedTransport::new());
    sim.add_axis((*cal).clone());
    sim.connect().await.unwrap();
    let controller = PrecisionPositioningController::new(
        AxisPositionModel::new(cal.clone()),
        AxisDrive::new(cal, sim.clone()),
        config,
    );
    (sim, controller)
}

fn positioning_events(rx: &mut broadcast::Receiver<MachineEvent>) -> Vec<(MovePhase, f64)> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let MachineEvent::Positioning(p) = event {
            events.push((p.phase, p.travelled_fraction));
        }
    }
    events
}

/// Stages only move forward, each entered at or past its threshold.
fn assert_stages_in_order(events: &[(MovePhase, f64)], profile: &SpeedProfile) {
    let mut last_stage = 0;
    let mut approached = false;
    for (phase, fraction) in events {
        let stage = match phase {
            MovePhase::Seeking { stage } => {
                assert!(!approached, "seeking after approaching: {events:?}");
                *stage
            }
            MovePhase::Approaching => {
                approached = true;
                profile.last_stage()
            }
            _ => continue,
        };
        assert!(stage >= last_stage, "stage went back: {events:?}");
        if stage > 0 {
            let threshold = profile.stages[stage - 1].until_fraction;
            assert!(
                *fraction >= threshold,
                "entered stage {stage} at {fraction} (< {threshold})"
            );
        }
        last_stage = stage;
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn frozen_sensor_faults_after_max_stuck_samples() {
    let (sim, mut controller) = rig(center_piston(), PositioningConfig::default()).await;
    sim.set_frozen(AxisId::CenterPiston, true);

    let started = Instant::now();
    let outcome = controller.run(100.0, CancelSignal::never()).await;
    let elapsed = started.elapsed();

    assert_eq!(
        outcome,
        MoveOutcome::Faulted(FaultReason::SensorFreeze { raw: 0, samples: 20 })
    );
    // 20 samples at 50 ms.
    assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1010), "{elapsed:?}");
    assert_eq!(sim.holding(2), 0);
    assert_eq!(controller.phase(), MovePhase::Faulted);
}

#[tokio::test(start_paused = true)]
async fn stages_advance_only_past_their_thresholds() {
    let (events_tx, mut events_rx) = broadcast::channel(512);
    let (_sim, controller) = rig(center_piston(), PositioningConfig::default()).await;
    let mut controller = controller.with_events(events_tx);

    let outcome = controller.run(150.0, CancelSignal::never()).await;
    assert!(outcome.is_settled(), "{outcome:?}");

    let events = positioning_events(&mut events_rx);
    assert!(!events.is_empty());
    assert_eq!(events.last().map(|(phase, _)| *phase), Some(MovePhase::Settled));
    assert_stages_in_order(&events, &SpeedProfile::default());
}

#[tokio::test(start_paused = true)]
async fn leaving_a_wide_tolerance_band_keeps_the_stage() {
    let mut cal = center_piston();
    cal.position_tolerance_mm = 3.0;
    let model = AxisPositionModel::new(Arc::new(cal.clone()));
    let config = PositioningConfig {
        settle_samples: 30,
        ..PositioningConfig::default()
    };
    let (events_tx, mut events_rx) = broadcast::channel(512);
    let (sim, controller) = rig(cal, config).await;
    let mut controller = controller.with_events(events_tx);

    let task = tokio::spawn(async move { controller.run(10.0, CancelSignal::never()).await });
    // In the band (7..13 mm) after ~200 ms, settled only after 30 more samples.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(sim.holding(2), 0, "output released inside the band");

    // Pushed back out to 6.7 mm, short of the slowest stage's threshold.
    sim.set_raw(AxisId::CenterPiston, model.ruler_from_position(6.7));

    let outcome = task.await.unwrap();
    let MoveOutcome::Settled { position_mm, .. } = outcome else {
        panic!("expected settle, got {outcome:?}");
    };
    assert!((position_mm - 10.0).abs() <= 3.0);

    let events = positioning_events(&mut events_rx);
    assert_eq!(events.last().map(|(phase, _)| *phase), Some(MovePhase::Settled));
    assert!(
        events.iter().all(|(phase, _)| *phase != MovePhase::Approaching),
        "slowest stage entered early: {events:?}"
    );
    assert_stages_in_order(&events, &SpeedProfile::default());
}

#[tokio::test(start_paused = true)]
async fn slow_axis_times_out() {
    let config = PositioningConfig {
        move_timeout_ms: 500,
        ..PositioningConfig::default()
    };
    let (sim, mut controller) = rig(center_piston(), config).await;
    sim.set_gain(AxisId::CenterPiston, 20.0);

    let outcome = controller.run(150.0, CancelSignal::never()).await;
    let MoveOutcome::Faulted(FaultReason::Timeout { elapsed }) = outcome else {
        panic!("expected timeout, got {outcome:?}");
    };
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(600));
    assert_eq!(sim.holding(2), 0);
}

#[tokio::test(start_paused = true)]
async fn reversed_valve_is_reported_as_drift() {
    let (sim, mut controller) = rig(center_piston(), PositioningConfig::default()).await;
    sim.set_raw(AxisId::CenterPiston, 2000);
    sim.set_gain(AxisId::CenterPiston, -150.0);

    let outcome = controller.run(150.0, CancelSignal::never()).await;
    let MoveOutcome::Faulted(FaultReason::Drift { drift_mm }) = outcome else {
        panic!("expected drift, got {outcome:?}");
    };
    assert!(drift_mm > 2.0);
    assert_eq!(sim.holding(2), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_releases_outputs() {
    let (sim, mut controller) = rig(center_piston(), PositioningConfig::default()).await;
    let (handle, signal) = cancel_pair();

    let task = tokio::spawn(async move { controller.run(150.0, signal).await });
    sleep(Duration::from_millis(300)).await;
    assert_ne!(sim.holding(2), 0);

    handle.cancel();
    let outcome = task.await.unwrap();
    assert_eq!(outcome, MoveOutcome::Faulted(FaultReason::Cancelled));
    assert_eq!(sim.holding(2), 0);
    assert!(sim.raw(AxisId::CenterPiston).unwrap() > 0);
}

#[tokio::test(start_paused = true)]
async fn safety_flag_aborts_running_move() {
    let (safety_tx, safety_rx) = watch::channel(SafetyFlags::empty());
    let (sim, controller) = rig(center_piston(), PositioningConfig::default()).await;
    let mut controller = controller.with_safety(safety_rx);

    let task = tokio::spawn(async move { controller.run(150.0, CancelSignal::never()).await });
    sleep(Duration::from_millis(200)).await;
    safety_tx.send_replace(SafetyFlags::EMERGENCY_STOP | SafetyFlags::ALARM);

    let outcome = task.await.unwrap();
    assert_eq!(
        outcome,
        MoveOutcome::Faulted(FaultReason::SafetyInterlock(SafetyFlags::EMERGENCY_STOP))
    );
    assert_eq!(sim.holding(2), 0);
}

#[tokio::test(start_paused = true)]
async fn coil_axis_settles_and_releases_both_coils() {
    let (sim, mut controller) = rig(left_clamp(), PositioningConfig::default()).await;

    let outcome = controller.run(40.0, CancelSignal::never()).await;
    let MoveOutcome::Settled { position_mm, .. } = outcome else {
        panic!("expected settle, got {outcome:?}");
    };
    assert!((position_mm - 40.0).abs() <= 1.0);
    assert!(!sim.coil(10));
    assert!(!sim.coil(11));
}

#[tokio::test(start_paused = true)]
async fn lost_ruler_faults_with_transport_error() {
    let (sim, controller) = rig(center_piston(), PositioningConfig::default()).await;
    let mut controller = controller;

    let failing = sim.clone();
    let task = tokio::spawn(async move { controller.run(150.0, CancelSignal::never()).await });
    sleep(Duration::from_millis(120)).await;
    failing.fail_address(2);

    let outcome = task.await.unwrap();
    assert!(
        matches!(outcome, MoveOutcome::Faulted(FaultReason::Transport(_))),
        "{outcome:?}"
    );
}
