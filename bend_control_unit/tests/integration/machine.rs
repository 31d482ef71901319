//! Integration test: machine facade over the shipped configuration.
//!
//! Loads `config/machine.toml`, simulates every configured axis and checks
//! command gating, supervision by the status loop and reference handling.

use bend_common::axis::{AxisId, Direction, Motion};
use bend_common::config::{ConfigLoader, MachineConfig, SpeedProfile};
use bend_common::event::MachineEvent;
use bend_common::fieldbus::{FieldbusError, FieldbusTransport};
use bend_common::status::{ConnectionState, SafetyFlags};
use bend_control_unit::{ControlError, FaultReason, Machine, MoveOutcome};
use bend_hal::SimulatedTransport;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

// ── Helpers ─────────────────────────────────────────────────────────

const ESTOP_COIL: u16 = 100;

fn machine_config() -> MachineConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/machine.toml");
    let config = MachineConfig::load(&path).expect("shipped config loads");
    config.validate().expect("shipped config is valid");
    config
}

async fn rig() -> (Arc<SimulatedTransport>, Arc<Machine>) {
    let config = machine_config();
    let sim = Arc::new(SimulatedTransport::from_config(&config));
    let machine = Arc::new(Machine::new(Arc::new(config), sim.clone()));
    machine.connect().await.unwrap();
    (sim, machine)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn move_settles_and_closes_valve() {
    let (sim, machine) = rig().await;

    let outcome = machine
        .move_axis(AxisId::CenterPiston, 100.0, None)
        .await
        .unwrap();
    let MoveOutcome::Settled { position_mm, .. } = outcome else {
        panic!("expected settle, got {outcome:?}");
    };
    assert!((position_mm - 100.0).abs() <= 0.3);

    let state = machine.axis_state(AxisId::CenterPiston).unwrap();
    assert!(state.is_at_target);
    assert!(!state.is_moving);
    assert_eq!(state.motion, Motion::Closed);
    assert_eq!(state.target_position_mm, 100.0);
    assert_eq!(sim.holding(2), 0);
    assert!(!sim.coil(2));
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_blocks_new_motion() {
    let (sim, machine) = rig().await;
    sim.set_coil(ESTOP_COIL, true);

    assert_eq!(
        machine.move_axis(AxisId::CenterPiston, 50.0, None).await,
        Err(ControlError::SafetyInterlock(SafetyFlags::EMERGENCY_STOP))
    );
    assert_eq!(
        machine.jog_axis(AxisId::LeftPiston, Direction::Forward, 50.0).await,
        Err(ControlError::SafetyInterlock(SafetyFlags::EMERGENCY_STOP))
    );
    assert_eq!(sim.holding(0), 0);
    assert_eq!(sim.holding(2), 0);
}

#[tokio::test(start_paused = true)]
async fn unreadable_safety_input_refuses_motion() {
    let (sim, machine) = rig().await;
    sim.set_coil(ESTOP_COIL, true);
    sim.fail_address(ESTOP_COIL);

    let unreadable = Err(ControlError::Fieldbus(FieldbusError::Timeout {
        address: ESTOP_COIL,
    }));
    assert_eq!(
        machine.jog_axis(AxisId::LeftPiston, Direction::Forward, 50.0).await,
        unreadable
    );
    assert_eq!(
        machine
            .move_axis(AxisId::CenterPiston, 50.0, None)
            .await
            .map(|_| 0.0),
        unreadable
    );
    assert_eq!(sim.holding(0), 0);
    assert!(!sim.coil(0));
    assert_eq!(sim.holding(2), 0);
}

#[tokio::test(start_paused = true)]
async fn losing_a_safety_input_stops_running_axes() {
    let (sim, machine) = rig().await;
    let mut events = machine.subscribe();
    let sync = machine.start_sync();

    machine
        .jog_axis(AxisId::LeftPiston, Direction::Forward, 50.0)
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(sim.coil(0));

    // The input itself stays off; only its read fails.
    sim.fail_address(ESTOP_COIL);
    sleep(Duration::from_millis(300)).await;

    assert!(!sim.coil(0));
    assert_eq!(sim.holding(0), 0);
    assert!(machine.get_status().safety.contains(SafetyFlags::EMERGENCY_STOP));

    let mut violation = None;
    while let Ok(event) = events.try_recv() {
        if let MachineEvent::SafetyViolation(flags) = event {
            violation = Some(flags);
        }
    }
    assert_eq!(violation, Some(SafetyFlags::EMERGENCY_STOP));

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn commands_are_validated_before_motion() {
    let (_sim, machine) = rig().await;

    assert_eq!(
        machine.move_axis(AxisId::CenterPiston, 250.0, None).await,
        Err(ControlError::LimitReached {
            axis: AxisId::CenterPiston,
            direction: Direction::Forward,
        })
    );
    assert_eq!(
        machine.move_axis(AxisId::CenterPiston, -50.0, None).await,
        Err(ControlError::LimitReached {
            axis: AxisId::CenterPiston,
            direction: Direction::Backward,
        })
    );
    assert!(matches!(
        machine
            .move_axis(AxisId::CenterPiston, 50.0, Some(SpeedProfile { stages: Vec::new() }))
            .await,
        Err(ControlError::InvalidProfile(_))
    ));
    assert_eq!(
        machine.jog_axis(AxisId::LeftPiston, Direction::Forward, 0.0).await,
        Err(ControlError::InvalidSpeed(0.0))
    );
    assert_eq!(
        machine.jog_axis(AxisId::LeftPiston, Direction::Forward, 120.0).await,
        Err(ControlError::InvalidSpeed(120.0))
    );
    // Left piston rests at its lower bound.
    assert_eq!(
        machine.jog_axis(AxisId::LeftPiston, Direction::Backward, 50.0).await,
        Err(ControlError::LimitReached {
            axis: AxisId::LeftPiston,
            direction: Direction::Backward,
        })
    );
    assert!(matches!(
        "middle_piston".parse::<AxisId>().map_err(ControlError::from),
        Err(ControlError::UnknownAxis(name)) if name == "middle_piston"
    ));
}

#[tokio::test(start_paused = true)]
async fn reference_zeroes_signed_axis_only() {
    let (sim, machine) = rig().await;
    sim.set_raw(AxisId::Rotation, 1000);

    let reference = machine.set_reference(AxisId::Rotation).await.unwrap();
    // 1000 / 4095 of a 180 mm stroke, rounded to 0.01 mm.
    assert!((reference - 43.96).abs() < 1e-9);
    let state = machine.axis_state(AxisId::Rotation).unwrap();
    assert_eq!(state.current_position_mm, 0.0);
    assert_eq!(state.raw_register, 1000);

    assert_eq!(
        machine.set_reference(AxisId::LeftPiston).await,
        Err(ControlError::RulerModeMismatch {
            axis: AxisId::LeftPiston,
            expected: "signed_relative",
        })
    );
}

#[tokio::test(start_paused = true)]
async fn second_move_cancels_the_first() {
    let (_sim, machine) = rig().await;

    let first = machine
        .start_move(AxisId::CenterPiston, 150.0, None)
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    let outcome = machine
        .move_axis(AxisId::CenterPiston, 20.0, None)
        .await
        .unwrap();
    assert!(outcome.is_settled(), "{outcome:?}");
    assert_eq!(
        first.await.unwrap(),
        MoveOutcome::Faulted(FaultReason::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn status_loop_publishes_decoded_snapshots() {
    let (sim, machine) = rig().await;
    sim.set_coil(20, true);
    sim.set_coil(30, true);

    let sync = machine.start_sync();
    sleep(Duration::from_millis(350)).await;

    let status = machine.get_status();
    assert!(status.sequence >= 3);
    assert_eq!(status.connection, ConnectionState::Connected);
    assert_eq!(status.axes.len(), 6);
    assert_eq!(status.motors.get("main"), Some(&true));
    assert_eq!(status.motors.get("pump"), Some(&false));
    assert_eq!(status.sensors.part_presence.get("infeed"), Some(&true));
    assert!(status.safety.is_empty());
    assert!(!status.any_moving());

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn safety_violation_stops_a_running_jog() {
    let (sim, machine) = rig().await;
    let mut events = machine.subscribe();
    let sync = machine.start_sync();

    let volts = machine
        .jog_axis(AxisId::LeftPiston, Direction::Forward, 50.0)
        .await
        .unwrap();
    assert!(volts < 0.0);
    sleep(Duration::from_millis(300)).await;
    assert!(sim.coil(0));
    let polled = machine.get_status().axis(AxisId::LeftPiston).unwrap().clone();
    assert!(polled.speed_mmps > 0.0);
    // Motion and voltage come from the output readback.
    assert_eq!(polled.motion, Motion::Forward);
    assert_eq!(polled.current_voltage, volts);

    sim.set_coil(ESTOP_COIL, true);
    sleep(Duration::from_millis(300)).await;

    assert!(!sim.coil(0));
    assert_eq!(sim.holding(0), 0);
    let state = machine.axis_state(AxisId::LeftPiston).unwrap();
    assert_eq!(state.motion, Motion::Closed);

    let mut violation = None;
    while let Ok(event) = events.try_recv() {
        if let MachineEvent::SafetyViolation(flags) = event {
            violation = Some(flags);
        }
    }
    assert_eq!(violation, Some(SafetyFlags::EMERGENCY_STOP));

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn jog_stops_at_travel_limit() {
    let (sim, machine) = rig().await;
    sim.set_raw(AxisId::CenterPiston, 3900);
    let sync = machine.start_sync();

    machine
        .jog_axis(AxisId::CenterPiston, Direction::Forward, 100.0)
        .await
        .unwrap();
    sleep(Duration::from_millis(1000)).await;

    assert_eq!(sim.holding(2), 0);
    assert!(!sim.coil(2));
    let state = machine.axis_state(AxisId::CenterPiston).unwrap();
    assert_eq!(state.motion, Motion::Closed);
    assert!(state.current_position_mm > 199.0);

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_axes_and_rejects_commands() {
    let (sim, machine) = rig().await;
    machine
        .jog_axis(AxisId::RightPiston, Direction::Forward, 30.0)
        .await
        .unwrap();
    assert!(sim.coil(1));

    machine.disconnect().await.unwrap();
    assert!(!machine.is_connected());
    assert!(!sim.coil(1));
    assert_eq!(sim.holding(1), 0);

    assert_eq!(
        machine.move_axis(AxisId::CenterPiston, 50.0, None).await,
        Err(ControlError::Fieldbus(FieldbusError::NotConnected))
    );
}
