//! In-memory focuser for testing without hardware.
//!
//! The virtual device runs its motor on a background thread and emits the
//! same `I`/`O`/`F` byte stream a real RoboFocus does, so completion tracking,
//! external-move detection and command discipline go through exactly the same
//! code as [`HardwareEngine`](crate::engine::HardwareEngine).
//!
//! Faults can be injected per exchange: response latency, a permanent timeout
//! switch, a countdown of forced timeouts and random checksum corruption.

use crate::engine::motion::{self, ByteSource, MotionLimits, WaitOutcome};
use crate::engine::state::{EngineCore, Link, Reply};
use crate::engine::{
    BYTE_TIMEOUT, Backlash, BacklashDirection, FocuserEngine, MovementState, RetryPolicy,
    STALL_TIMEOUT, TEMPERATURE_MAX_AGE, WATCHER_LIMIT, celsius_to_raw, lock,
};
use crate::error::{Error, Result};
use crate::protocol::packet::{self, Command, PACKET_LEN, STEP_IN, STEP_OUT};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Port name reported by the simulator.
pub const SIMULATOR_PORT: &str = "SIMULATOR";

/// Backlash register after power-up: compensation off.
const INITIAL_BACKLASH: u32 = 100_000;

/// Simulator settings.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Step counter at power-up.
    pub initial_position: u32,
    /// Hardware travel limit at power-up.
    pub max_travel: u32,
    /// Motor speed.
    pub speed_steps_per_sec: u32,
    /// Reply to `FV`; an integer or a decimal such as `"3.20"`, at most six
    /// characters.
    pub firmware_version: String,
    /// Base temperature.
    pub temperature_celsius: f64,
    /// Uniform noise amplitude added to every reading.
    pub temperature_noise: f64,
    /// Linear drift since the simulator started.
    pub temperature_drift_per_hour: f64,
    /// Delay before every reply.
    pub response_latency: Duration,
    /// Time out every exchange.
    pub inject_timeout: bool,
    /// Time out this many exchanges, then answer normally.
    pub forced_timeouts: u32,
    /// Probability in `[0, 1]` of corrupting a reply checksum.
    pub checksum_error_rate: f64,
    /// Retry budget.
    pub retry: RetryPolicy,
    /// Per-byte read timeout while tracking motion.
    pub byte_timeout: Duration,
    /// Silence that counts as a stalled move.
    pub stall_timeout: Duration,
    /// How long the external-move watcher waits for completion.
    pub watcher_limit: Duration,
    /// Maximum age of a cached temperature.
    pub temperature_max_age: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            initial_position: 0,
            max_travel: 60_000,
            speed_steps_per_sec: 500,
            firmware_version: "002100".to_string(),
            temperature_celsius: 16.85,
            temperature_noise: 0.0,
            temperature_drift_per_hour: 0.0,
            response_latency: Duration::ZERO,
            inject_timeout: false,
            forced_timeouts: 0,
            checksum_error_rate: 0.0,
            retry: RetryPolicy::default(),
            byte_timeout: BYTE_TIMEOUT,
            stall_timeout: STALL_TIMEOUT,
            watcher_limit: WATCHER_LIMIT,
            temperature_max_age: TEMPERATURE_MAX_AGE,
        }
    }
}

impl SimulatorConfig {
    /// Reject settings the virtual device cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.checksum_error_rate) {
            return Err(Error::Config(format!(
                "checksum_error_rate must be within [0, 1], got {}",
                self.checksum_error_rate
            )));
        }
        let version = &self.firmware_version;
        if version.is_empty()
            || version.len() > 6
            || !version.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(Error::Config(format!(
                "firmware_version must be 1-6 printable characters, got {version:?}"
            )));
        }
        if self.speed_steps_per_sec == 0 {
            return Err(Error::Config("speed_steps_per_sec must be positive".into()));
        }
        if self.temperature_noise < 0.0 {
            return Err(Error::Config("temperature_noise must not be negative".into()));
        }
        if self.initial_position > self.max_travel {
            return Err(Error::Config(format!(
                "initial_position {} exceeds max_travel {}",
                self.initial_position, self.max_travel
            )));
        }
        Ok(())
    }
}

/// Registers of the virtual device.
#[derive(Debug)]
struct VirtualDevice {
    position: u32,
    max_travel: u32,
    backlash: u32,
}

impl VirtualDevice {
    fn new(config: &SimulatorConfig) -> Self {
        Self {
            position: config.initial_position,
            max_travel: config.max_travel,
            backlash: INITIAL_BACKLASH,
        }
    }
}

/// Unsolicited bytes from the virtual device, in arrival order.
#[derive(Default)]
struct EventQueue {
    bytes: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl EventQueue {
    fn push(&self, bytes: &[u8]) {
        lock(&self.bytes).extend(bytes);
        self.ready.notify_all();
    }

    fn pop(&self, timeout: Duration) -> Option<u8> {
        let guard = lock(&self.bytes);
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |bytes| bytes.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        guard.pop_front()
    }

    fn front(&self) -> Option<u8> {
        lock(&self.bytes).front().copied()
    }

    fn clear(&self) {
        lock(&self.bytes).clear();
    }
}

/// [`ByteSource`] view of the event queue.
struct EventReader<'a> {
    events: &'a EventQueue,
    timeout: Duration,
}

impl ByteSource for EventReader<'_> {
    fn next_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.events.pop(self.timeout))
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        for (n, slot) in buf.iter_mut().enumerate() {
            match self.events.pop(self.timeout) {
                Some(byte) => *slot = byte,
                None => return Ok(n),
            }
        }
        Ok(buf.len())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.events.clear();
        Ok(())
    }
}

struct MotorRun {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Inner {
    config: SimulatorConfig,
    core: EngineCore,
    /// Serializes exchanges, moves and tracking like the port lock does.
    channel: Mutex<()>,
    device: Mutex<VirtualDevice>,
    events: EventQueue,
    motor: Mutex<Option<MotorRun>>,
    inject_timeout: AtomicBool,
    forced_timeouts: AtomicU32,
    started: Mutex<Instant>,
}

/// RoboFocus engine backed by a virtual device.
pub struct SimulatorEngine {
    inner: Arc<Inner>,
}

impl Default for SimulatorEngine {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimulatorEngine {
    /// Simulator powered up with `config`; not yet connected.
    pub fn new(config: SimulatorConfig) -> Self {
        let device = VirtualDevice::new(&config);
        let core = EngineCore::new(config.initial_position, config.max_travel);
        Self {
            inner: Arc::new(Inner {
                core,
                channel: Mutex::new(()),
                device: Mutex::new(device),
                events: EventQueue::default(),
                motor: Mutex::new(None),
                inject_timeout: AtomicBool::new(config.inject_timeout),
                forced_timeouts: AtomicU32::new(config.forced_timeouts),
                started: Mutex::new(Instant::now()),
                config,
            }),
        }
    }

    /// Simulator configuration.
    pub fn config(&self) -> &SimulatorConfig {
        &self.inner.config
    }

    /// Turn the permanent timeout fault on or off.
    pub fn set_inject_timeout(&self, enabled: bool) {
        self.inner.inject_timeout.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `count` exchanges time out.
    pub fn set_forced_timeouts(&self, count: u32) {
        self.inner.forced_timeouts.store(count, Ordering::SeqCst);
    }

    /// Position of the virtual motor, bypassing the engine's cache.
    pub fn device_position(&self) -> u32 {
        lock(&self.inner.device).position
    }

    /// Move the motor as if the hand controller were pressed.
    ///
    /// The engine only learns about it from the step bytes the next query
    /// runs into.
    pub fn press_handset(&self, target: u32) -> Result<()> {
        let inner = &self.inner;
        inner.core.ensure_connected()?;
        inner.core.ensure_idle("use the handset")?;
        let max_travel = lock(&inner.device).max_travel;
        if target > max_travel {
            return Err(Error::InvalidValue(format!(
                "position {target} out of range [0, {max_travel}]"
            )));
        }

        info!("[SIMULATOR] Handset move to {target}");
        let _channel = lock(&inner.channel);
        inner.start_motor(target);
        Ok(())
    }

    /// Return the virtual device to its power-up state.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.core.cancel_waiters();
        let _channel = lock(&inner.channel);
        inner.stop_motor();
        inner.events.clear();
        *lock(&inner.device) = VirtualDevice::new(&inner.config);
        inner.core.set_position(inner.config.initial_position);
        inner.core.set_max_travel(inner.config.max_travel);
        inner.core.set_state(MovementState::Idle);
        inner.core.clear_caches();
        inner
            .inject_timeout
            .store(inner.config.inject_timeout, Ordering::SeqCst);
        inner
            .forced_timeouts
            .store(inner.config.forced_timeouts, Ordering::SeqCst);
        *lock(&inner.started) = Instant::now();
        info!("[SIMULATOR] Reset to initial state");
    }
}

impl Link for Inner {
    fn core(&self) -> &EngineCore {
        &self.core
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    fn temperature_max_age(&self) -> Duration {
        self.config.temperature_max_age
    }

    fn exchange(self: &Arc<Self>, command: Command, value: u32) -> Result<Reply> {
        let request = packet::encode(command, value)?;
        let _channel = lock(&self.channel);
        trace!("TX: {}", packet::hex(&request));

        if !self.config.response_latency.is_zero() {
            thread::sleep(self.config.response_latency);
        }
        if self.inject_timeout.load(Ordering::SeqCst) {
            warn!("[SIMULATOR] Injected timeout for {command}");
            return Err(Error::Timeout(format!("no response to {command}")));
        }
        if self
            .forced_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            warn!("[SIMULATOR] Forced timeout for {command}");
            return Err(Error::Timeout(format!("no response to {command}")));
        }

        // A running handset move answers with step bytes instead of a reply.
        if let Some(byte @ (STEP_IN | STEP_OUT)) = self.events.front() {
            let direction = if byte == STEP_IN { "inward" } else { "outward" };
            info!("External movement detected ({direction})");
            self.core.set_state(MovementState::MovingExternal);
            self.spawn_watcher();
            return Ok(Reply::Pending);
        }

        let mut response = self.respond(command, value)?;
        let rate = self.config.checksum_error_rate;
        if rate > 0.0 && rand::thread_rng().gen_bool(rate.min(1.0)) {
            warn!("[SIMULATOR] Corrupting checksum of {command} reply");
            response[PACKET_LEN - 1] = response[PACKET_LEN - 1].wrapping_add(1);
        }
        trace!("RX: {}", packet::hex(&response));

        let reply = packet::decode(&response)?.validated()?;
        if reply.is_position_report() {
            self.core.set_position(reply.value.as_u32());
        }
        Ok(Reply::Packet(reply))
    }

    fn flush(&self) {
        self.events.clear();
    }
}

impl Inner {
    /// Apply `command` to the virtual device and build its reply.
    fn respond(&self, command: Command, value: u32) -> Result<[u8; PACKET_LEN]> {
        let mut device = lock(&self.device);
        match command {
            Command::VERSION => {
                let version = &self.config.firmware_version;
                match version.parse::<u32>() {
                    Ok(v) => packet::encode(Command::VERSION, v),
                    Err(_) => packet::encode_field(Command::VERSION, &format!("{version:0>6}")),
                }
            },
            // Moves never come through here; FG is always a query.
            Command::GOTO => packet::encode(Command::POSITION, device.position),
            Command::TEMPERATURE => {
                packet::encode(Command::TEMPERATURE, celsius_to_raw(self.temperature()))
            },
            Command::BACKLASH => {
                if value != 0 {
                    device.backlash = value;
                    debug!("[SIMULATOR] Backlash register set to {value}");
                }
                packet::encode(Command::BACKLASH, device.backlash)
            },
            Command::MAX_TRAVEL => {
                if value != 0 {
                    device.max_travel = value;
                    debug!("[SIMULATOR] Max travel set to {value}");
                }
                packet::encode(Command::MAX_TRAVEL, device.max_travel)
            },
            Command::SYNC => {
                device.position = value;
                debug!("[SIMULATOR] Position synced to {value}");
                packet::encode(Command::SYNC, value)
            },
            other => {
                warn!("[SIMULATOR] Unknown command {other}, echoing");
                packet::encode(other, value)
            },
        }
    }

    fn temperature(&self) -> f64 {
        let hours = lock(&self.started).elapsed().as_secs_f64() / 3600.0;
        let mut celsius =
            self.config.temperature_celsius + self.config.temperature_drift_per_hour * hours;
        let noise = self.config.temperature_noise;
        if noise > 0.0 {
            celsius += rand::thread_rng().gen_range(-noise..=noise);
        }
        celsius
    }

    /// Steps per motor tick and the tick length.
    fn tick(&self) -> (u32, Duration) {
        let speed = self.config.speed_steps_per_sec.max(1);
        let per_tick = (speed / 10).max(1);
        let tick = Duration::from_secs_f64(f64::from(per_tick) / f64::from(speed));
        (per_tick, tick)
    }

    /// Drive the motor toward `target`, replacing any running move.
    fn start_motor(self: &Arc<Self>, target: u32) {
        self.stop_motor();
        let (per_tick, tick) = self.tick();
        if self.advance(target, per_tick) {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("robofocus-sim-motor".into())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(tick);
                    if flag.load(Ordering::SeqCst) || inner.advance(target, per_tick) {
                        break;
                    }
                }
            });
        match spawned {
            Ok(thread) => *lock(&self.motor) = Some(MotorRun { stop, thread }),
            Err(e) => error!("[SIMULATOR] Failed to start motor thread: {e}"),
        }
    }

    fn stop_motor(&self) {
        let run = lock(&self.motor).take();
        if let Some(run) = run {
            run.stop.store(true, Ordering::SeqCst);
            if run.thread.join().is_err() {
                error!("[SIMULATOR] Motor thread panicked");
            }
        }
    }

    /// Move up to `max_steps` toward `target`, emitting one byte per step and
    /// the completion packet on arrival. Returns true once at the target.
    fn advance(&self, target: u32, max_steps: u32) -> bool {
        let mut device = lock(&self.device);
        let steps = device.position.abs_diff(target).min(max_steps);
        let byte = if target > device.position {
            device.position += steps;
            STEP_OUT
        } else {
            device.position -= steps;
            STEP_IN
        };
        if steps > 0 {
            self.events.push(&vec![byte; steps as usize]);
        }
        if device.position != target {
            return false;
        }

        match packet::encode(Command::POSITION, device.position) {
            Ok(done) => self.events.push(&done),
            Err(e) => error!("[SIMULATOR] Cannot encode completion packet: {e}"),
        }
        true
    }

    fn reader(&self) -> EventReader<'_> {
        EventReader {
            events: &self.events,
            timeout: self.config.byte_timeout,
        }
    }

    fn spawn_watcher(self: &Arc<Self>) {
        if !self.core.claim_watcher() {
            return;
        }
        let inner = Arc::clone(self);
        let epoch = self.core.wait_epoch();
        let spawned = thread::Builder::new()
            .name("robofocus-sim-watcher".into())
            .spawn(move || {
                let limits = MotionLimits {
                    stall_timeout: None,
                    deadline: inner.config.watcher_limit,
                };
                let outcome = {
                    let _channel = lock(&inner.channel);
                    motion::track(
                        &mut inner.reader(),
                        inner.core.position_cell(),
                        &limits,
                        || inner.core.watcher_cancelled(epoch),
                    )
                };
                inner.core.finish_watch(outcome);
                inner.core.release_watcher();
            });
        if let Err(e) = spawned {
            error!("Failed to start external movement watcher: {e}");
            self.core.release_watcher();
            self.core.set_state(MovementState::Idle);
        }
    }

    fn wait_for_programmatic(&self, timeout: Duration) -> Result<u32> {
        let epoch = self.core.move_epoch();
        debug!("Waiting for movement to end (timeout: {}s)", timeout.as_secs());
        let limits = MotionLimits {
            stall_timeout: Some(self.config.stall_timeout),
            deadline: timeout,
        };
        let outcome = {
            let _channel = lock(&self.channel);
            motion::track(
                &mut self.reader(),
                self.core.position_cell(),
                &limits,
                || self.core.programmatic_cancelled(epoch),
            )
        };
        self.core.finish_wait(outcome, timeout)
    }
}

impl FocuserEngine for SimulatorEngine {
    fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.core.is_connected() {
            warn!("Already connected");
            return Ok(());
        }
        inner.config.validate()?;

        if !inner.config.response_latency.is_zero() {
            thread::sleep(inner.config.response_latency);
        }
        let position = lock(&inner.device).position;
        inner.core.set_position(position);
        inner.core.set_state(MovementState::Idle);
        inner
            .core
            .set_firmware(Some(inner.config.firmware_version.clone()));
        inner.core.set_connected(true);
        info!(
            "[SIMULATOR] Connected (firmware: {}, position: {position})",
            inner.config.firmware_version
        );
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.core.set_connected(false) {
            return Ok(());
        }
        inner.core.cancel_waiters();
        // A waiter holds the channel until it sees the state change.
        inner.core.set_state(MovementState::Idle);
        {
            let _channel = lock(&inner.channel);
            inner.stop_motor();
            inner.events.clear();
        }
        inner.core.clear_caches();
        info!("[SIMULATOR] Disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    fn get_position(&self) -> Result<u32> {
        self.inner.read_position()
    }

    fn move_absolute(&self, target: u32) -> Result<()> {
        let inner = &self.inner;
        inner.core.ensure_connected()?;
        let request = packet::encode(Command::GOTO, target)?;
        inner.core.begin_move(target)?;
        info!("Moving to position {target}");

        let _channel = lock(&inner.channel);
        trace!("TX: {}", packet::hex(&request));
        inner.events.clear();
        if !inner.config.response_latency.is_zero() {
            thread::sleep(inner.config.response_latency);
        }
        let clamped = target.min(lock(&inner.device).max_travel);
        inner.start_motor(clamped);
        debug!("Move command sent to position {target}");
        Ok(())
    }

    fn halt(&self) -> Result<()> {
        let inner = &self.inner;
        inner.core.ensure_connected()?;
        info!("Halting movement");

        inner.core.cancel_waiters();
        {
            let _channel = lock(&inner.channel);
            inner.stop_motor();
            inner.events.clear();
            inner.core.set_position(lock(&inner.device).position);
        }
        inner.core.set_state(MovementState::Idle);
        info!("Halt command sent");
        Ok(())
    }

    fn wait_for_movement_end(&self, timeout: Duration) -> Result<u32> {
        let inner = &self.inner;
        inner.core.ensure_connected()?;
        match inner.core.state() {
            MovementState::Idle => Ok(inner.core.position()),
            MovementState::MovingExternal => inner.core.wait_for_external(timeout),
            MovementState::MovingProgrammatic => inner.wait_for_programmatic(timeout),
        }
    }

    fn movement_state(&self) -> MovementState {
        self.inner.core.state()
    }

    fn get_temperature(&self) -> Result<f64> {
        self.inner.read_temperature()
    }

    fn get_backlash(&self) -> Result<Backlash> {
        self.inner.read_backlash()
    }

    fn set_backlash(&self, direction: BacklashDirection, amount: u32) -> Result<()> {
        self.inner.write_backlash(direction, amount)
    }

    fn get_max_travel(&self) -> Result<u32> {
        self.inner.read_max_travel()
    }

    fn set_max_travel(&self, value: u32) -> Result<()> {
        self.inner.write_max_travel(value)
    }

    fn sync_position(&self, value: u32) -> Result<()> {
        self.inner.write_sync(value)
    }

    fn force_idle(&self) {
        self.inner.core.force_idle();
    }

    fn cancel_wait(&self) {
        self.inner.core.cancel_waiters();
    }

    fn firmware_version(&self) -> Option<String> {
        self.inner.core.firmware()
    }

    fn port_name(&self) -> String {
        SIMULATOR_PORT.to_string()
    }

    fn cached_position(&self) -> u32 {
        self.inner.core.position()
    }
}

impl Drop for SimulatorEngine {
    fn drop(&mut self) {
        let _ = self.disconnect();
        // The motor thread holds an Arc; stop it even when never connected.
        self.inner.stop_motor();
    }
}
