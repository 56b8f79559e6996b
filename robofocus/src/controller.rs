//! Focuser controller.
//!
//! Sits on top of one [`FocuserEngine`] and works in logical positions:
//! `logical = physical - zero_offset`. Moves are validated against the
//! persisted limits, then handed to the engine while a background waiter
//! tracks completion and refreshes the position cache once the move ends.
//!
//! The engine can be swapped (hardware for simulator or back) only while
//! disconnected.

use crate::engine::{Backlash, FocuserEngine, MOVE_TIMEOUT, lock};
use crate::error::{Error, Result};
use crate::settings::{FocuserSettings, SettingsStore};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long `disconnect` waits for the completion waiter to exit.
const WAITER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const JOIN_POLL: Duration = Duration::from_millis(20);

/// State shared with the completion waiter.
#[derive(Default)]
struct Cache {
    /// Last known physical position.
    position: AtomicU32,
    /// Last known signed backlash, if read since connecting.
    backlash: Mutex<Option<i32>>,
}

/// Logical-position focuser on top of an engine.
pub struct FocuserController {
    engine: RwLock<Arc<dyn FocuserEngine>>,
    store: Arc<dyn SettingsStore>,
    settings: Mutex<FocuserSettings>,
    cache: Arc<Cache>,
    connected: AtomicBool,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl FocuserController {
    /// Controller over `engine` with settings loaded from `store`.
    pub fn new(engine: Arc<dyn FocuserEngine>, store: Arc<dyn SettingsStore>) -> Result<Self> {
        let settings = store.load()?;
        settings.validate()?;
        Ok(Self {
            engine: RwLock::new(engine),
            store,
            settings: Mutex::new(settings),
            cache: Arc::new(Cache::default()),
            connected: AtomicBool::new(false),
            waiter: Mutex::new(None),
        })
    }

    /// The current engine.
    pub fn engine(&self) -> Arc<dyn FocuserEngine> {
        Arc::clone(&self.engine.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the engine; only allowed while disconnected.
    pub fn set_engine(&self, engine: Arc<dyn FocuserEngine>) -> Result<()> {
        if self.is_connected() {
            return Err(Error::InvalidOperation(
                "cannot switch engines while connected".into(),
            ));
        }
        let mut current = self.engine.write().unwrap_or_else(PoisonError::into_inner);
        info!(
            "Switching engine from {} to {}",
            current.port_name(),
            engine.port_name()
        );
        *current = engine;
        Ok(())
    }

    /// Copy of the current settings.
    pub fn settings(&self) -> FocuserSettings {
        lock(&self.settings).clone()
    }

    /// Whether both the controller and its engine are connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.engine().is_connected()
    }

    fn ensure_connected(&self) -> Result<Arc<dyn FocuserEngine>> {
        let engine = self.engine();
        if self.connected.load(Ordering::SeqCst) && engine.is_connected() {
            Ok(engine)
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Connect the engine and pull hardware settings.
    ///
    /// Firmware version, max travel and backlash are read best-effort; values
    /// that differ from the stored settings are saved.
    pub fn connect(&self) -> Result<()> {
        if self.is_connected() {
            warn!("Already connected");
            return Ok(());
        }

        let engine = self.engine();
        engine.connect()?;
        self.connected.store(true, Ordering::SeqCst);
        *lock(&self.cache.backlash) = None;

        let physical = match engine.get_position() {
            Ok(p) => p,
            Err(e) => {
                warn!("Could not read initial position: {e}");
                engine.cached_position()
            },
        };
        self.cache.position.store(physical, Ordering::SeqCst);

        self.sync_hardware_settings(engine.as_ref());
        info!(
            "Focuser connected at position {}",
            lock(&self.settings).to_logical(physical)
        );
        Ok(())
    }

    fn sync_hardware_settings(&self, engine: &dyn FocuserEngine) {
        let mut updated = self.settings();

        if let Some(version) = engine.firmware_version() {
            if updated.firmware_version.as_deref() != Some(version.as_str()) {
                info!("Firmware version: {version}");
                updated.firmware_version = Some(version);
            }
        }

        match engine.get_max_travel() {
            Ok(max_travel) if max_travel > 0 && max_travel != updated.max_step => {
                info!(
                    "Hardware max travel: {max_travel} (config was {})",
                    updated.max_step
                );
                updated.max_step = max_travel;
                let (zero_offset, min_step) = (updated.zero_offset, updated.min_step);
                updated.fit_to_max_step();
                if (updated.zero_offset, updated.min_step) != (zero_offset, min_step) {
                    warn!(
                        "Move limits adjusted to the hardware travel: zero offset {}, min step {}",
                        updated.zero_offset, updated.min_step
                    );
                }
            },
            Ok(max_travel) => debug!("Hardware max travel: {max_travel}"),
            Err(e) => warn!("Could not read max travel from hardware: {e}"),
        }

        match engine.get_backlash() {
            Ok(backlash) => {
                let signed = backlash.to_signed();
                info!(
                    "Hardware backlash: {} steps on {} motion",
                    backlash.amount, backlash.direction
                );
                *lock(&self.cache.backlash) = Some(signed);
                updated.backlash = signed;
            },
            Err(e) => warn!("Could not read backlash from hardware: {e}"),
        }

        if let Err(e) = updated.validate() {
            warn!("Ignoring hardware settings, keeping stored ones: {e}");
            return;
        }
        let mut settings = lock(&self.settings);
        if *settings != updated {
            *settings = updated;
            if let Err(e) = self.store.save(&settings) {
                warn!("Failed to save hardware settings: {e}");
            }
        }
    }

    /// Stop the completion waiter and disconnect the engine.
    pub fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let engine = self.engine();
        self.stop_waiter(engine.as_ref());
        engine.disconnect()?;
        info!("Focuser disconnected");
        Ok(())
    }

    fn stop_waiter(&self, engine: &dyn FocuserEngine) {
        let Some(handle) = lock(&self.waiter).take() else {
            return;
        };
        engine.cancel_wait();

        let start = Instant::now();
        while !handle.is_finished() {
            if start.elapsed() > WAITER_JOIN_TIMEOUT {
                warn!(
                    "Completion waiter did not stop within {}s, detaching",
                    WAITER_JOIN_TIMEOUT.as_secs()
                );
                return;
            }
            thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            error!("Completion waiter panicked");
        }
    }

    /// Logical position. Reads the engine's live count while moving.
    pub fn get_position(&self) -> Result<i32> {
        let engine = self.ensure_connected()?;
        let physical = if engine.is_moving() {
            engine.cached_position()
        } else {
            let physical = engine.get_position()?;
            self.cache.position.store(physical, Ordering::SeqCst);
            physical
        };
        Ok(lock(&self.settings).to_logical(physical))
    }

    /// Whether the engine reports any movement.
    pub fn is_moving(&self) -> bool {
        self.ensure_connected().is_ok_and(|engine| engine.is_moving())
    }

    /// Start a move to logical `target` without waiting for it to finish.
    pub fn move_to(&self, target: i32) -> Result<()> {
        let engine = self.ensure_connected()?;
        let settings = self.settings();

        let min = settings.min_step as i32;
        let max = settings.logical_max();
        if target < min || target > max {
            return Err(Error::InvalidValue(format!(
                "position {target} out of range [{min}, {max}]"
            )));
        }
        let current = settings.to_logical(self.cache.position.load(Ordering::SeqCst));
        let delta = target.abs_diff(current);
        if delta > settings.max_increment {
            return Err(Error::InvalidValue(format!(
                "move of {delta} steps exceeds max increment {}",
                settings.max_increment
            )));
        }

        let physical = settings.to_physical(target)?;
        engine.move_absolute(physical)?;
        info!("Movement started: {current} -> {target}");
        self.spawn_waiter(engine);
        Ok(())
    }

    fn spawn_waiter(&self, engine: Arc<dyn FocuserEngine>) {
        let mut slot = lock(&self.waiter);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if let Some(finished) = slot.take() {
            let _ = finished.join();
        }

        let cache = Arc::clone(&self.cache);
        let spawned = thread::Builder::new()
            .name("robofocus-move-waiter".into())
            .spawn(move || match engine.wait_for_movement_end(MOVE_TIMEOUT) {
                Ok(physical) => {
                    cache.position.store(physical, Ordering::SeqCst);
                    debug!("Movement complete at physical position {physical}");
                },
                Err(e) => {
                    cache
                        .position
                        .store(engine.cached_position(), Ordering::SeqCst);
                    error!("Movement did not complete: {e}");
                },
            });
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(e) => error!("Failed to start completion waiter: {e}"),
        }
    }

    /// Stop the motor and refresh the position.
    pub fn halt(&self) -> Result<()> {
        let engine = self.ensure_connected()?;
        engine.halt()?;
        match engine.get_position() {
            Ok(physical) => self.cache.position.store(physical, Ordering::SeqCst),
            Err(e) => warn!("Could not read position after halt: {e}"),
        }
        info!(
            "Movement halted at position {}",
            lock(&self.settings).to_logical(self.cache.position.load(Ordering::SeqCst))
        );
        Ok(())
    }

    /// Temperature in °C from the engine.
    pub fn get_temperature(&self) -> Result<f64> {
        self.ensure_connected()?.get_temperature()
    }

    /// Signed backlash; the cached value while moving.
    pub fn get_backlash(&self) -> Result<i32> {
        let engine = self.ensure_connected()?;
        if engine.is_moving() {
            if let Some(cached) = *lock(&self.cache.backlash) {
                return Ok(cached);
            }
        }
        let signed = engine.get_backlash()?.to_signed();
        *lock(&self.cache.backlash) = Some(signed);
        Ok(signed)
    }

    /// Set signed backlash in `[-255, 255]` and persist it.
    pub fn set_backlash(&self, value: i32) -> Result<()> {
        let engine = self.ensure_connected()?;
        let backlash = Backlash::from_signed(value)?;
        engine.set_backlash(backlash.direction, backlash.amount)?;
        *lock(&self.cache.backlash) = Some(value);
        info!(
            "Backlash set to {value} ({} motion, {} steps)",
            backlash.direction, backlash.amount
        );
        self.update_settings(|s| s.backlash = value)
    }

    /// Hardware travel limit.
    pub fn get_max_travel(&self) -> Result<u32> {
        let engine = self.ensure_connected()?;
        if engine.is_moving() {
            return Ok(lock(&self.settings).max_step);
        }
        engine.get_max_travel()
    }

    /// Write the hardware travel limit and persist it.
    pub fn set_max_travel(&self, value: u32) -> Result<()> {
        let engine = self.ensure_connected()?;
        let mut updated = self.settings();
        updated.max_step = value;
        updated.validate()?;
        engine.set_max_travel(value)?;
        self.save(updated)
    }

    /// Make the current position logical zero.
    pub fn set_zero_here(&self) -> Result<()> {
        let engine = self.ensure_connected()?;
        if engine.is_moving() {
            return Err(Error::MovementInProgress(
                "cannot set zero while moving".into(),
            ));
        }
        let physical = engine.get_position()?;
        self.cache.position.store(physical, Ordering::SeqCst);
        info!("Zero offset set to current physical position {physical}");
        self.update_settings(|s| s.zero_offset = physical)
    }

    /// Set and persist the zero offset.
    pub fn set_zero_offset(&self, value: u32) -> Result<()> {
        self.update_settings(|s| s.zero_offset = value)
    }

    /// Set and persist the lowest logical move target.
    pub fn set_min_step(&self, value: u32) -> Result<()> {
        self.update_settings(|s| s.min_step = value)
    }

    /// Set and persist the largest single move.
    pub fn set_max_increment(&self, value: u32) -> Result<()> {
        self.update_settings(|s| s.max_increment = value)
    }

    /// Redefine the current position as logical `value` without moving.
    pub fn sync_position(&self, value: i32) -> Result<()> {
        let engine = self.ensure_connected()?;
        let physical = self.settings().to_physical(value)?;
        engine.sync_position(physical)?;
        self.cache
            .position
            .store(engine.cached_position(), Ordering::SeqCst);
        Ok(())
    }

    /// Firmware version from the engine, or the one seen last time.
    pub fn firmware_version(&self) -> Option<String> {
        self.engine()
            .firmware_version()
            .or_else(|| lock(&self.settings).firmware_version.clone())
    }

    fn update_settings(&self, change: impl FnOnce(&mut FocuserSettings)) -> Result<()> {
        let mut updated = self.settings();
        change(&mut updated);
        updated.validate()?;
        self.save(updated)
    }

    fn save(&self, updated: FocuserSettings) -> Result<()> {
        let mut settings = lock(&self.settings);
        self.store.save(&updated)?;
        *settings = updated;
        Ok(())
    }
}

impl Drop for FocuserController {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Error disconnecting focuser: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        BacklashDirection, MovementState, RetryPolicy, SimulatorConfig, SimulatorEngine,
    };
    use crate::settings::MemoryStore;

    fn simulator(initial_position: u32) -> Arc<SimulatorEngine> {
        Arc::new(SimulatorEngine::new(SimulatorConfig {
            initial_position,
            speed_steps_per_sec: 50_000,
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(1),
            },
            byte_timeout: Duration::from_millis(10),
            stall_timeout: Duration::from_millis(500),
            ..Default::default()
        }))
    }

    fn controller(
        engine: Arc<SimulatorEngine>,
        settings: FocuserSettings,
    ) -> (FocuserController, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(settings));
        let controller = FocuserController::new(engine, store.clone()).unwrap();
        (controller, store)
    }

    fn wait_idle(controller: &FocuserController) {
        let start = Instant::now();
        while controller.is_moving() {
            assert!(start.elapsed() < Duration::from_secs(10), "move did not finish");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_operations_require_connection() {
        let (controller, _) = controller(simulator(0), FocuserSettings::default());
        assert!(matches!(controller.get_position(), Err(Error::NotConnected)));
        assert!(matches!(controller.move_to(10), Err(Error::NotConnected)));
        assert!(matches!(controller.halt(), Err(Error::NotConnected)));
        assert!(!controller.is_moving());
    }

    #[test]
    fn test_zero_offset_maps_positions() {
        let engine = simulator(1500);
        let (controller, _) = controller(
            engine.clone(),
            FocuserSettings {
                zero_offset: 1000,
                ..Default::default()
            },
        );
        controller.connect().unwrap();
        assert_eq!(controller.get_position().unwrap(), 500);

        controller.move_to(700).unwrap();
        wait_idle(&controller);
        assert_eq!(engine.device_position(), 1700);
        assert_eq!(controller.get_position().unwrap(), 700);
    }

    #[test]
    fn test_move_validation() {
        let (controller, _) = controller(
            simulator(0),
            FocuserSettings {
                min_step: 100,
                max_increment: 5000,
                ..Default::default()
            },
        );
        controller.connect().unwrap();

        assert!(matches!(controller.move_to(99), Err(Error::InvalidValue(_))));
        assert!(matches!(controller.move_to(60_001), Err(Error::InvalidValue(_))));
        assert!(matches!(controller.move_to(5001), Err(Error::InvalidValue(_))));
        assert!(!controller.is_moving());

        controller.move_to(5000).unwrap();
        wait_idle(&controller);
        assert_eq!(controller.get_position().unwrap(), 5000);
    }

    #[test]
    fn test_connect_pulls_hardware_settings() {
        let engine = simulator(0);
        let (controller, store) = controller(
            engine,
            FocuserSettings {
                max_step: 30_000,
                ..Default::default()
            },
        );
        controller.connect().unwrap();

        let saved = store.snapshot();
        assert_eq!(saved.max_step, 60_000);
        assert_eq!(saved.firmware_version.as_deref(), Some("002100"));
        assert_eq!(saved.backlash, 0);
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_connect_keeps_settings_valid_when_travel_shrinks() {
        let engine = Arc::new(SimulatorEngine::new(SimulatorConfig {
            max_travel: 30_000,
            ..Default::default()
        }));
        let (controller, store) = controller(
            engine,
            FocuserSettings {
                min_step: 40_000,
                ..Default::default()
            },
        );
        controller.connect().unwrap();

        let saved = store.snapshot();
        assert_eq!(saved.max_step, 30_000);
        assert_eq!(saved.min_step, 29_999);
        saved.validate().unwrap();
        controller.settings().validate().unwrap();

        // The store can seed a new controller again.
        let reloaded = MemoryStore::new(saved);
        assert!(FocuserController::new(simulator(0), Arc::new(reloaded)).is_ok());
    }

    #[test]
    fn test_signed_backlash() {
        let engine = simulator(0);
        let (controller, store) = controller(engine.clone(), FocuserSettings::default());
        controller.connect().unwrap();

        controller.set_backlash(50).unwrap();
        let raw = engine.get_backlash().unwrap();
        assert_eq!((raw.direction, raw.amount), (BacklashDirection::Out, 50));
        assert_eq!(controller.get_backlash().unwrap(), 50);

        controller.set_backlash(-50).unwrap();
        let raw = engine.get_backlash().unwrap();
        assert_eq!((raw.direction, raw.amount), (BacklashDirection::In, 50));
        assert_eq!(controller.get_backlash().unwrap(), -50);
        assert_eq!(store.snapshot().backlash, -50);

        assert!(matches!(controller.set_backlash(256), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn test_backlash_served_from_cache_while_moving() {
        let engine = Arc::new(SimulatorEngine::new(SimulatorConfig {
            speed_steps_per_sec: 100,
            ..Default::default()
        }));
        let (controller, _) = controller(engine, FocuserSettings::default());
        controller.connect().unwrap();
        controller.set_backlash(-20).unwrap();

        controller.move_to(10_000).unwrap();
        assert!(controller.is_moving());
        assert_eq!(controller.get_backlash().unwrap(), -20);
        controller.halt().unwrap();
        assert!(!controller.is_moving());
    }

    #[test]
    fn test_engine_swap_only_while_disconnected() {
        let (controller, _) = controller(simulator(0), FocuserSettings::default());
        controller.connect().unwrap();
        assert!(matches!(
            controller.set_engine(simulator(5)),
            Err(Error::InvalidOperation(_))
        ));

        controller.disconnect().unwrap();
        controller.set_engine(simulator(5)).unwrap();
        controller.connect().unwrap();
        assert_eq!(controller.get_position().unwrap(), 5);
    }

    #[test]
    fn test_disconnect_stops_waiter() {
        let engine = Arc::new(SimulatorEngine::new(SimulatorConfig {
            speed_steps_per_sec: 100,
            byte_timeout: Duration::from_millis(10),
            ..Default::default()
        }));
        let (controller, _) = controller(engine.clone(), FocuserSettings::default());
        controller.connect().unwrap();
        controller.move_to(20_000).unwrap();

        let start = Instant::now();
        controller.disconnect().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
        assert!(lock(&controller.waiter).is_none());
        assert_eq!(engine.movement_state(), MovementState::Idle);
    }

    #[test]
    fn test_disconnect_soon_after_moves_is_prompt() {
        let engine = Arc::new(SimulatorEngine::new(SimulatorConfig {
            speed_steps_per_sec: 100,
            byte_timeout: Duration::from_millis(10),
            ..Default::default()
        }));
        let (controller, _) = controller(engine.clone(), FocuserSettings::default());
        for delay_ms in [0, 1, 5, 20] {
            controller.connect().unwrap();
            controller.move_to(20_000).unwrap();
            thread::sleep(Duration::from_millis(delay_ms));

            let start = Instant::now();
            controller.disconnect().unwrap();
            assert!(
                start.elapsed() < Duration::from_secs(1),
                "disconnect after {delay_ms}ms took {:?}",
                start.elapsed()
            );
            assert_eq!(engine.movement_state(), MovementState::Idle);
        }
    }

    #[test]
    fn test_halt_soon_after_move_stops_waiter() {
        let engine = Arc::new(SimulatorEngine::new(SimulatorConfig {
            speed_steps_per_sec: 100,
            byte_timeout: Duration::from_millis(10),
            ..Default::default()
        }));
        let (controller, _) = controller(engine.clone(), FocuserSettings::default());
        controller.connect().unwrap();
        controller.move_to(20_000).unwrap();

        let start = Instant::now();
        controller.halt().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
        assert!(!controller.is_moving());
        controller.disconnect().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
    }

    #[test]
    fn test_calibration_is_persisted() {
        let engine = simulator(2500);
        let (controller, store) = controller(engine, FocuserSettings::default());
        controller.connect().unwrap();

        controller.set_zero_here().unwrap();
        assert_eq!(store.snapshot().zero_offset, 2500);
        assert_eq!(controller.get_position().unwrap(), 0);

        controller.set_min_step(10).unwrap();
        controller.set_max_increment(2000).unwrap();
        let saved = store.snapshot();
        assert_eq!((saved.min_step, saved.max_increment), (10, 2000));

        assert!(matches!(controller.set_max_increment(0), Err(Error::InvalidValue(_))));
        assert_eq!(store.snapshot().max_increment, 2000);
    }

    #[test]
    fn test_set_max_travel_writes_hardware_and_settings() {
        let engine = simulator(0);
        let (controller, store) = controller(engine.clone(), FocuserSettings::default());
        controller.connect().unwrap();

        controller.set_max_travel(40_000).unwrap();
        assert_eq!(engine.get_max_travel().unwrap(), 40_000);
        assert_eq!(store.snapshot().max_step, 40_000);
        assert!(matches!(controller.move_to(40_001), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn test_sync_position_uses_logical_space() {
        let engine = simulator(800);
        let (controller, _) = controller(
            engine.clone(),
            FocuserSettings {
                zero_offset: 100,
                ..Default::default()
            },
        );
        controller.connect().unwrap();
        controller.sync_position(400).unwrap();
        assert_eq!(engine.device_position(), 500);
        assert_eq!(controller.get_position().unwrap(), 400);
    }
}
