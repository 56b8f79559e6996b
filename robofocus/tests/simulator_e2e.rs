//! End-to-end tests driving the controller against the simulator.

use robofocus::{
    Error, FocuserController, FocuserEngine, FocuserSettings, MemoryStore, MovementState,
    RetryPolicy, SimulatorConfig, SimulatorEngine,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn fast(config: SimulatorConfig) -> SimulatorConfig {
    SimulatorConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        },
        byte_timeout: Duration::from_millis(20),
        ..config
    }
}

fn wait_until_idle(controller: &FocuserController, limit: Duration) {
    let start = Instant::now();
    while controller.is_moving() {
        assert!(start.elapsed() < limit, "move still running after {limit:?}");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn move_to_thirty_thousand() {
    let _ = env_logger::builder().is_test(true).try_init();

    let engine = Arc::new(SimulatorEngine::new(fast(SimulatorConfig {
        initial_position: 0,
        speed_steps_per_sec: 60_000,
        ..Default::default()
    })));
    let store = Arc::new(MemoryStore::new(FocuserSettings {
        max_step: 60_000,
        ..Default::default()
    }));
    let controller = FocuserController::new(engine, store).unwrap();
    controller.connect().unwrap();

    controller.move_to(30_000).unwrap();
    assert!(controller.is_moving());

    wait_until_idle(&controller, Duration::from_secs(10));
    assert_eq!(controller.get_position().unwrap(), 30_000);
    assert!(!controller.is_moving());

    controller.disconnect().unwrap();
    assert!(!controller.is_connected());
}

#[test]
fn logical_positions_follow_zero_offset() {
    let engine = Arc::new(SimulatorEngine::new(fast(SimulatorConfig {
        initial_position: 1500,
        speed_steps_per_sec: 20_000,
        ..Default::default()
    })));
    let store = Arc::new(MemoryStore::new(FocuserSettings {
        zero_offset: 1000,
        ..Default::default()
    }));
    let controller = FocuserController::new(engine.clone(), store).unwrap();
    controller.connect().unwrap();
    assert_eq!(controller.get_position().unwrap(), 500);

    controller.move_to(200).unwrap();
    wait_until_idle(&controller, Duration::from_secs(5));
    assert_eq!(engine.device_position(), 1200);
    assert_eq!(controller.get_position().unwrap(), 200);

    // Targets below min_step are refused even though reads may go negative.
    assert!(matches!(controller.move_to(-1), Err(Error::InvalidValue(_))));
}

#[test]
fn forced_timeouts_recover_within_retry_budget() {
    let engine = Arc::new(SimulatorEngine::new(fast(SimulatorConfig {
        initial_position: 321,
        ..Default::default()
    })));
    let controller =
        FocuserController::new(engine.clone(), Arc::new(MemoryStore::default())).unwrap();
    controller.connect().unwrap();

    engine.set_forced_timeouts(2);
    assert_eq!(controller.get_position().unwrap(), 321);

    engine.set_forced_timeouts(3);
    let err = controller.get_position().unwrap_err();
    assert!(matches!(err, Error::MaxRetriesExceeded { attempts: 3, .. }), "{err}");
}

#[test]
fn sensor_failure_surfaces_through_controller() {
    // 82 °C reads as raw ADC 1200, outside the sensor's plausible range.
    let engine = Arc::new(SimulatorEngine::new(fast(SimulatorConfig {
        temperature_celsius: 82.0,
        ..Default::default()
    })));
    let controller = FocuserController::new(engine, Arc::new(MemoryStore::default())).unwrap();
    controller.connect().unwrap();
    assert!(matches!(controller.get_temperature(), Err(Error::Sensor(_))));
}

#[test]
fn handset_move_blocks_settings_until_it_ends() {
    let engine = Arc::new(SimulatorEngine::new(fast(SimulatorConfig {
        initial_position: 100,
        speed_steps_per_sec: 1000,
        ..Default::default()
    })));
    let controller =
        FocuserController::new(engine.clone(), Arc::new(MemoryStore::default())).unwrap();
    controller.connect().unwrap();

    engine.press_handset(600).unwrap();
    // The query sees step bytes and reports the cached position instead.
    controller.get_position().unwrap();
    assert_eq!(engine.movement_state(), MovementState::MovingExternal);
    assert!(matches!(
        controller.set_max_travel(50_000),
        Err(Error::MovementInProgress(_))
    ));

    let final_position = engine.wait_for_movement_end(Duration::from_secs(5)).unwrap();
    assert_eq!(final_position, 600);
    assert_eq!(controller.get_position().unwrap(), 600);
}

#[test]
fn halt_stops_a_long_move() {
    let engine = Arc::new(SimulatorEngine::new(fast(SimulatorConfig {
        speed_steps_per_sec: 500,
        ..Default::default()
    })));
    let controller =
        FocuserController::new(engine.clone(), Arc::new(MemoryStore::default())).unwrap();
    controller.connect().unwrap();

    controller.move_to(40_000).unwrap();
    thread::sleep(Duration::from_millis(250));
    controller.halt().unwrap();
    assert!(!controller.is_moving());

    let stopped = controller.get_position().unwrap();
    assert!(stopped > 0 && stopped < 40_000, "{stopped}");
    thread::sleep(Duration::from_millis(250));
    assert_eq!(engine.device_position(), stopped as u32);
}
