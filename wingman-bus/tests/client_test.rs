//! Tests for the bus client against the simulated bus

use std::time::{Duration, Instant};
use wingman_bus::{table, BusClient, BusError, DeviceError, SimulatedBus};
use wingman_core::{AxisConfig, OperatingMode, PidGains};

fn client(bus: &SimulatedBus) -> BusClient<SimulatedBus> {
    BusClient::new(bus.clone(), Duration::from_millis(20))
}

#[test]
fn test_ping() {
    let bus = SimulatedBus::with_servos(&[1, 2]);
    let mut client = client(&bus);
    assert_eq!(client.ping(1).unwrap(), 311);
    assert_eq!(client.ping(2).unwrap(), 311);
}

#[test]
fn test_ping_missing_servo_times_out() {
    let bus = SimulatedBus::with_servos(&[1]);
    let mut client = client(&bus);
    let started = Instant::now();
    let err = client.ping(7).unwrap_err();
    assert!(matches!(err, BusError::Timeout { .. }));
    assert!(err.is_comm());
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn test_torque_and_mode() {
    let bus = SimulatedBus::with_servos(&[1]);
    let mut client = client(&bus);

    client.set_operating_mode(1, OperatingMode::ExtendedPosition).unwrap();
    assert_eq!(bus.operating_mode(1), Some(4));

    client.set_torque(1, true).unwrap();
    assert_eq!(bus.torque_enabled(1), Some(true));

    // Mode register is locked while torque is on
    let err = client
        .set_operating_mode(1, OperatingMode::Position)
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::Protocol { id: 1, error: DeviceError::Access }
    ));

    client.set_torque(1, false).unwrap();
    assert_eq!(bus.torque_enabled(1), Some(false));
}

#[test]
fn test_pid_speed_and_current_registers() {
    let bus = SimulatedBus::with_servos(&[2]);
    let mut client = client(&bus);

    client
        .set_pid_gains(2, PidGains { kp: 800, ki: 10, kd: 40 })
        .unwrap();
    client.set_speed(2, 120).unwrap();
    client.set_goal_current(2, 300).unwrap();

    assert_eq!(bus.register(2, table::POSITION_P_GAIN), Some(800));
    assert_eq!(bus.register(2, table::POSITION_I_GAIN), Some(10));
    assert_eq!(bus.register(2, table::POSITION_D_GAIN), Some(40));
    assert_eq!(bus.register(2, table::GOAL_SPEED), Some(120));
    assert_eq!(bus.register(2, table::GOAL_CURRENT), Some(300));
    assert_eq!(client.read(2, table::GOAL_SPEED).unwrap(), 120);
}

#[test]
fn test_sync_write_then_sync_read() {
    let bus = SimulatedBus::with_servos(&[1, 2]);
    let mut client = client(&bus);
    let pan = AxisConfig::default_pan();
    let tilt = AxisConfig::default_tilt();

    client.set_operating_mode(1, OperatingMode::ExtendedPosition).unwrap();
    client.set_torque(1, true).unwrap();
    client.set_torque(2, true).unwrap();

    client
        .set_goal_positions(&[pan.goal(-12000), tilt.goal(1500)])
        .unwrap();
    assert_eq!(bus.sync_write_count(), 1);
    assert_eq!(bus.goal_position(1), Some(-12000));
    assert_eq!(bus.goal_position(2), Some(1500));

    let positions = client.get_present_positions(&[1, 2]).unwrap();
    assert_eq!(positions.get(&1), Some(&-12000));
    assert_eq!(positions.get(&2), Some(&1500));
}

#[test]
fn test_empty_goal_list_sends_nothing() {
    let bus = SimulatedBus::with_servos(&[1]);
    let mut client = client(&bus);
    client.set_goal_positions(&[]).unwrap();
    assert_eq!(bus.sync_write_count(), 0);
}

#[test]
fn test_duplicate_goal_is_rejected_before_sending() {
    let bus = SimulatedBus::with_servos(&[1]);
    let mut client = client(&bus);
    let pan = AxisConfig::default_pan();
    let err = client
        .set_goal_positions(&[pan.goal(10), pan.goal(20)])
        .unwrap_err();
    assert!(matches!(err, BusError::InvalidRequest(_)));
    assert_eq!(bus.sync_write_count(), 0);
}

#[test]
fn test_sync_read_with_unresponsive_servo_times_out() {
    let bus = SimulatedBus::with_servos(&[1, 2]);
    bus.set_unresponsive(2, true);
    let mut client = client(&bus);
    let err = client.get_present_positions(&[1, 2]).unwrap_err();
    match err {
        BusError::Timeout { waiting_for, .. } => assert!(waiting_for.contains('2')),
        other => panic!("expected timeout, got {other:?}"),
    }

    bus.set_unresponsive(2, false);
    assert_eq!(client.get_present_positions(&[1, 2]).unwrap().len(), 2);
}

#[test]
fn test_injected_fault_is_protocol_error() {
    let bus = SimulatedBus::with_servos(&[1]);
    bus.inject_error(1, DeviceError::ResultFail);
    let mut client = client(&bus);

    let err = client.set_torque(1, true).unwrap_err();
    assert!(err.is_protocol());
    assert!(!err.is_comm());

    bus.clear_error(1);
    client.set_torque(1, true).unwrap();
}

#[test]
fn test_position_mode_rejects_out_of_range_goal() {
    let bus = SimulatedBus::with_servos(&[2]);
    let mut client = client(&bus);
    let err = client
        .write_register(2, table::GOAL_POSITION, 5000)
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::Protocol { id: 2, error: DeviceError::DataLimit }
    ));
    assert_eq!(bus.goal_position(2), Some(0));
}

#[test]
fn test_present_position_moved_by_hand() {
    let bus = SimulatedBus::with_servos(&[1]);
    let mut client = client(&bus);
    bus.set_present_position(1, -321);
    assert_eq!(client.read(1, table::PRESENT_POSITION).unwrap(), -321);
}

#[test]
fn test_configure_axis_unlocks_mode_then_enables_torque() {
    let bus = SimulatedBus::with_servos(&[1]);
    let mut client = client(&bus);
    client.set_torque(1, true).unwrap();

    let axis = AxisConfig {
        pid_gains: Some(PidGains { kp: 640, ki: 0, kd: 0 }),
        goal_current: Some(500),
        ..AxisConfig::default_pan()
    };
    assert!(client.configure_axis(&axis, 120).is_empty());
    assert_eq!(bus.operating_mode(1), Some(4));
    assert_eq!(bus.register(1, table::GOAL_SPEED), Some(120));
    assert_eq!(bus.register(1, table::POSITION_P_GAIN), Some(640));
    assert_eq!(bus.register(1, table::GOAL_CURRENT), Some(500));
    assert_eq!(bus.torque_enabled(1), Some(true));

    // Extended mode accepts multi-turn goals
    client.write_register(1, table::GOAL_POSITION, -1000).unwrap();
    assert_eq!(bus.goal_position(1), Some(-1000));
}

#[test]
fn test_configure_axis_reports_every_failed_step() {
    let bus = SimulatedBus::with_servos(&[1]);
    bus.inject_error(1, DeviceError::ResultFail);
    let mut client = client(&bus);

    let failures = client.configure_axis(&AxisConfig::default_pan(), 0);
    let steps: Vec<&str> = failures.iter().map(|(what, _)| *what).collect();
    assert_eq!(
        steps,
        vec!["disable torque", "set operating mode", "set speed", "enable torque"]
    );
    assert!(failures.iter().all(|(_, e)| e.is_protocol()));
}
