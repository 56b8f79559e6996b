//! State shared by every engine implementation: movement state machine,
//! command discipline, position/temperature caches and waiter bookkeeping,
//! plus the command-level operations built on a single request exchange.

use crate::engine::motion::WaitOutcome;
use crate::engine::{
    Backlash, BacklashDirection, DEFAULT_TEMPERATURE, MAX_TRAVEL_LIMIT, MovementState,
    RetryPolicy, lock, raw_to_celsius, sync_wire_value, validate_max_travel, validate_position,
    with_retries,
};
use crate::error::{Error, Result};
use crate::protocol::packet::{Command, Packet};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Poll interval while waiting on the external-move watcher.
const EXTERNAL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct TemperatureSample {
    celsius: f64,
    taken: Instant,
}

pub(crate) struct EngineCore {
    connected: AtomicBool,
    state: Mutex<MovementState>,
    position: AtomicU32,
    max_travel: AtomicU32,
    temperature: Mutex<Option<TemperatureSample>>,
    firmware: Mutex<Option<String>>,
    wait_epoch: AtomicU64,
    /// `wait_epoch` at the start of the current programmatic move.
    move_epoch: AtomicU64,
    watcher_running: AtomicBool,
}

impl EngineCore {
    pub(crate) fn new(position: u32, max_travel: u32) -> Self {
        Self {
            connected: AtomicBool::new(false),
            state: Mutex::new(MovementState::Idle),
            position: AtomicU32::new(position),
            max_travel: AtomicU32::new(max_travel),
            temperature: Mutex::new(None),
            firmware: Mutex::new(None),
            wait_epoch: AtomicU64::new(0),
            move_epoch: AtomicU64::new(0),
            watcher_running: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub(crate) fn set_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::SeqCst)
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    pub(crate) fn state(&self) -> MovementState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: MovementState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("Movement state: {} -> {state}", *current);
            *current = state;
        }
    }

    /// Move from `from` to `to`; false if the state was something else.
    pub(crate) fn transition(&self, from: MovementState, to: MovementState) -> bool {
        let mut current = lock(&self.state);
        if *current != from {
            return false;
        }
        debug!("Movement state: {from} -> {to}");
        *current = to;
        true
    }

    pub(crate) fn ensure_idle(&self, what: &str) -> Result<()> {
        match self.state() {
            MovementState::Idle => Ok(()),
            state => Err(Error::MovementInProgress(format!(
                "cannot {what} during {state} movement"
            ))),
        }
    }

    /// Reject commands the running motor would take as a stop request.
    pub(crate) fn check_discipline(&self, command: Command) -> Result<()> {
        match self.state() {
            MovementState::Idle => Ok(()),
            MovementState::MovingProgrammatic if command != Command::HALT => {
                Err(Error::MovementInProgress(format!(
                    "cannot send {command} during programmatic movement"
                )))
            },
            MovementState::MovingExternal
                if command != Command::GOTO && command != Command::HALT =>
            {
                Err(Error::MovementInProgress(format!(
                    "cannot send {command} during external movement (only FG/FQ allowed)"
                )))
            },
            _ => Ok(()),
        }
    }

    /// Start a programmatic move if idle.
    pub(crate) fn begin_move(&self, target: u32) -> Result<()> {
        let max_travel = self.max_travel();
        if target > max_travel {
            return Err(Error::InvalidValue(format!(
                "position {target} out of range [0, {max_travel}]"
            )));
        }
        let mut current = lock(&self.state);
        if *current != MovementState::Idle {
            return Err(Error::MovementInProgress(format!(
                "cannot start move during {} movement",
                *current
            )));
        }
        debug!("Movement state: {} -> {}", *current, MovementState::MovingProgrammatic);
        *current = MovementState::MovingProgrammatic;
        // Any cancel after this point ends the completion wait, even one
        // issued before the wait starts.
        self.move_epoch.store(self.wait_epoch(), Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn position_cell(&self) -> &AtomicU32 {
        &self.position
    }

    pub(crate) fn position(&self) -> u32 {
        self.position.load(Ordering::SeqCst)
    }

    pub(crate) fn set_position(&self, position: u32) {
        self.position.store(position, Ordering::SeqCst);
    }

    pub(crate) fn max_travel(&self) -> u32 {
        self.max_travel.load(Ordering::SeqCst)
    }

    pub(crate) fn set_max_travel(&self, value: u32) {
        self.max_travel.store(value, Ordering::SeqCst);
    }

    pub(crate) fn firmware(&self) -> Option<String> {
        lock(&self.firmware).clone()
    }

    pub(crate) fn set_firmware(&self, version: Option<String>) {
        *lock(&self.firmware) = version;
    }

    /// Temperature to report without I/O: the cache while moving (or the
    /// default), the cache when idle and younger than `max_age`, else `None`.
    pub(crate) fn cached_temperature(&self, max_age: Duration) -> Option<f64> {
        let cached = *lock(&self.temperature);
        if self.state().is_moving() {
            return Some(match cached {
                Some(sample) => sample.celsius,
                None => {
                    warn!(
                        "No cached temperature available during movement, returning {DEFAULT_TEMPERATURE}°C"
                    );
                    DEFAULT_TEMPERATURE
                },
            });
        }
        cached
            .filter(|sample| sample.taken.elapsed() < max_age)
            .map(|sample| {
                debug!(
                    "Temperature (cached, age {}s): {:.2}°C",
                    sample.taken.elapsed().as_secs(),
                    sample.celsius
                );
                sample.celsius
            })
    }

    /// Last reading regardless of age, or the default.
    pub(crate) fn last_temperature(&self) -> f64 {
        lock(&self.temperature).map_or(DEFAULT_TEMPERATURE, |s| s.celsius)
    }

    pub(crate) fn store_temperature(&self, celsius: f64) {
        *lock(&self.temperature) = Some(TemperatureSample {
            celsius,
            taken: Instant::now(),
        });
    }

    pub(crate) fn clear_caches(&self) {
        *lock(&self.temperature) = None;
    }

    pub(crate) fn wait_epoch(&self) -> u64 {
        self.wait_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_waiters(&self) {
        self.wait_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Claim the single watcher slot; false if a watcher is already alive.
    pub(crate) fn claim_watcher(&self) -> bool {
        !self.watcher_running.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release_watcher(&self) {
        self.watcher_running.store(false, Ordering::SeqCst);
    }

    /// Cancel check for the external-move watcher started at `epoch`.
    pub(crate) fn watcher_cancelled(&self, epoch: u64) -> bool {
        self.wait_epoch() != epoch || self.state() != MovementState::MovingExternal
    }

    pub(crate) fn move_epoch(&self) -> u64 {
        self.move_epoch.load(Ordering::SeqCst)
    }

    /// Cancel check for the completion wait of the move started at `epoch`.
    pub(crate) fn programmatic_cancelled(&self, epoch: u64) -> bool {
        self.wait_epoch() != epoch || self.state() != MovementState::MovingProgrammatic
    }

    /// Log how the external-move watcher ended and settle the state.
    pub(crate) fn finish_watch(&self, outcome: Result<WaitOutcome>) {
        match outcome {
            Ok(WaitOutcome::Completed(position)) => {
                debug!("External movement finished at position {position}");
            },
            Ok(WaitOutcome::Cancelled) => {
                debug!("External movement watcher stopped");
                return;
            },
            Ok(WaitOutcome::DeadlineExpired | WaitOutcome::Stalled(_)) => {
                warn!("External movement watcher timeout, resetting to idle");
            },
            Err(e) => error!("External movement watcher failed: {e}"),
        }
        self.transition(MovementState::MovingExternal, MovementState::Idle);
    }

    /// Map the result of a programmatic completion wait.
    pub(crate) fn finish_wait(&self, outcome: Result<WaitOutcome>, timeout: Duration) -> Result<u32> {
        let result = match outcome {
            Ok(WaitOutcome::Completed(p) | WaitOutcome::Stalled(p)) => Ok(p),
            Ok(WaitOutcome::Cancelled) => return Ok(self.position()),
            Ok(WaitOutcome::DeadlineExpired) => Err(Error::Timeout(format!(
                "movement did not complete within {}s",
                timeout.as_secs_f32()
            ))),
            Err(e) => {
                error!("Movement tracking failed: {e}");
                Err(e)
            },
        };
        self.transition(MovementState::MovingProgrammatic, MovementState::Idle);
        result
    }

    /// Wait for the external-move watcher to return the state to idle.
    pub(crate) fn wait_for_external(&self, timeout: Duration) -> Result<u32> {
        let start = Instant::now();
        while self.state() == MovementState::MovingExternal {
            if start.elapsed() > timeout {
                return Err(Error::Timeout(format!(
                    "external movement did not complete within {}s",
                    timeout.as_secs_f32()
                )));
            }
            thread::sleep(EXTERNAL_POLL);
        }
        Ok(self.position())
    }

    /// Drop back to idle and release any waiter.
    pub(crate) fn force_idle(&self) {
        self.cancel_waiters();
        self.set_state(MovementState::Idle);
    }
}

/// Result of one request exchange.
#[derive(Debug)]
pub(crate) enum Reply {
    Packet(Packet),
    /// The device started streaming step bytes instead of answering.
    Pending,
}

/// One request/response channel to a device.
///
/// Implementors provide a single exchange attempt; the provided methods add
/// discipline checks, retries and the per-command decoding.
pub(crate) trait Link: Send + Sync + Sized + 'static {
    fn core(&self) -> &EngineCore;

    fn retry_policy(&self) -> &RetryPolicy;

    fn temperature_max_age(&self) -> Duration;

    /// Write `command` and read its reply, once.
    fn exchange(self: &Arc<Self>, command: Command, value: u32) -> Result<Reply>;

    /// Discard buffered bytes between retry attempts.
    fn flush(&self);

    /// Send a command with retries.
    fn send_command(self: &Arc<Self>, command: Command, value: u32) -> Result<Reply> {
        self.core().ensure_connected()?;
        self.core().check_discipline(command)?;
        with_retries(
            self.retry_policy(),
            command.as_str(),
            || self.exchange(command, value),
            || self.flush(),
        )
    }

    /// Like `send_command`, but a pending reply is an error.
    fn query(self: &Arc<Self>, command: Command, value: u32) -> Result<Packet> {
        match self.send_command(command, value)? {
            Reply::Packet(reply) => Ok(reply),
            Reply::Pending => Err(Error::MovementInProgress(format!(
                "external movement started while sending {command}"
            ))),
        }
    }

    fn read_position(self: &Arc<Self>) -> Result<u32> {
        let core = self.core();
        core.ensure_connected()?;
        if core.state().is_moving() {
            return Ok(core.position());
        }

        match self.send_command(Command::GOTO, 0)? {
            Reply::Packet(reply) if reply.command == Command::POSITION => {
                Ok(reply.value.as_u32())
            },
            Reply::Packet(reply) => {
                warn!("Unexpected response to FG query: {}", reply.command);
                Ok(core.position())
            },
            Reply::Pending => Ok(core.position()),
        }
    }

    fn read_temperature(self: &Arc<Self>) -> Result<f64> {
        let core = self.core();
        core.ensure_connected()?;
        if let Some(celsius) = core.cached_temperature(self.temperature_max_age()) {
            return Ok(celsius);
        }

        let reply = match self.send_command(Command::TEMPERATURE, 0)? {
            Reply::Packet(reply) => reply,
            Reply::Pending => return Ok(core.last_temperature()),
        };
        if reply.command != Command::TEMPERATURE {
            warn!("Unexpected response to FT: {}", reply.command);
        }

        let raw = reply.value.as_u32();
        let celsius = raw_to_celsius(raw)?;
        core.store_temperature(celsius);
        info!("Temperature: {celsius:.2}°C (raw ADC: {raw})");
        Ok(celsius)
    }

    fn read_backlash(self: &Arc<Self>) -> Result<Backlash> {
        self.core().ensure_connected()?;
        self.core().ensure_idle("query backlash")?;

        let reply = self.query(Command::BACKLASH, 0)?;
        if reply.command != Command::BACKLASH {
            warn!("Unexpected response to FB: {}", reply.command);
            return Ok(Backlash::DISABLED);
        }
        let backlash = Backlash::from_wire(reply.value.as_u32());
        debug!(
            "Backlash settings: direction={}, amount={}",
            backlash.direction, backlash.amount
        );
        Ok(backlash)
    }

    fn write_backlash(self: &Arc<Self>, direction: BacklashDirection, amount: u32) -> Result<()> {
        self.core().ensure_connected()?;
        self.core().ensure_idle("set backlash")?;
        let backlash = Backlash::new(direction, amount)?;

        info!("Setting backlash: direction={direction}, amount={amount}");
        let reply = self.query(Command::BACKLASH, backlash.to_wire())?;
        if reply.command != Command::BACKLASH {
            warn!("Unexpected response to FB set: {}", reply.command);
        }
        Ok(())
    }

    fn read_max_travel(self: &Arc<Self>) -> Result<u32> {
        self.core().ensure_connected()?;
        self.core().ensure_idle("query max travel")?;

        let reply = self.query(Command::MAX_TRAVEL, 0)?;
        if reply.command != Command::MAX_TRAVEL {
            warn!("Unexpected response to FL: {}", reply.command);
            return Ok(MAX_TRAVEL_LIMIT);
        }
        let max_travel = reply.value.as_u32() % 100_000;
        self.core().set_max_travel(max_travel);
        debug!("Hardware max travel: {max_travel}");
        Ok(max_travel)
    }

    fn write_max_travel(self: &Arc<Self>, value: u32) -> Result<()> {
        self.core().ensure_connected()?;
        self.core().ensure_idle("set max travel")?;
        validate_max_travel(value)?;

        info!("Setting hardware max travel to {value}");
        let reply = self.query(Command::MAX_TRAVEL, value)?;
        if reply.command != Command::MAX_TRAVEL {
            warn!("Unexpected response to FL set: {}", reply.command);
        }
        self.core().set_max_travel(value);
        Ok(())
    }

    fn write_sync(self: &Arc<Self>, value: u32) -> Result<()> {
        self.core().ensure_connected()?;
        self.core().ensure_idle("sync position")?;
        validate_position(value)?;

        let wire = sync_wire_value(value);
        if wire != value {
            info!("Syncing hardware position to {wire} (requested {value})");
        } else {
            info!("Syncing hardware position to {wire}");
        }
        let reply = self.query(Command::SYNC, wire)?;
        if reply.command != Command::SYNC {
            warn!("Unexpected response to FS: {}", reply.command);
        }
        self.core().set_position(wire);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discipline_table() {
        let core = EngineCore::new(0, 65535);
        assert!(core.check_discipline(Command::TEMPERATURE).is_ok());

        core.set_state(MovementState::MovingProgrammatic);
        assert!(core.check_discipline(Command::HALT).is_ok());
        for command in [Command::GOTO, Command::TEMPERATURE, Command::BACKLASH, Command::VERSION] {
            assert!(matches!(
                core.check_discipline(command),
                Err(Error::MovementInProgress(_))
            ));
        }

        core.set_state(MovementState::MovingExternal);
        assert!(core.check_discipline(Command::HALT).is_ok());
        assert!(core.check_discipline(Command::GOTO).is_ok());
        assert!(core.check_discipline(Command::MAX_TRAVEL).is_err());
    }

    #[test]
    fn test_begin_move_checks_range_and_state() {
        let core = EngineCore::new(0, 1000);
        assert!(matches!(core.begin_move(1001), Err(Error::InvalidValue(_))));
        core.begin_move(1000).unwrap();
        assert_eq!(core.state(), MovementState::MovingProgrammatic);
        assert!(matches!(core.begin_move(10), Err(Error::MovementInProgress(_))));
    }

    #[test]
    fn test_cancel_before_wait_starts_is_seen() {
        let core = EngineCore::new(0, 1000);
        core.begin_move(500).unwrap();
        core.cancel_waiters();
        // A wait that starts only now still sees the cancel.
        let epoch = core.move_epoch();
        assert!(core.programmatic_cancelled(epoch));

        core.force_idle();
        core.begin_move(200).unwrap();
        let epoch = core.move_epoch();
        assert!(!core.programmatic_cancelled(epoch));
        core.set_state(MovementState::Idle);
        assert!(core.programmatic_cancelled(epoch));
    }

    #[test]
    fn test_temperature_cache_rules() {
        let core = EngineCore::new(0, 1000);
        assert_eq!(core.cached_temperature(Duration::from_secs(120)), None);

        core.set_state(MovementState::MovingExternal);
        assert_eq!(
            core.cached_temperature(Duration::from_secs(120)),
            Some(DEFAULT_TEMPERATURE)
        );

        core.store_temperature(12.5);
        assert_eq!(core.cached_temperature(Duration::ZERO), Some(12.5));

        core.set_state(MovementState::Idle);
        assert_eq!(core.cached_temperature(Duration::from_secs(120)), Some(12.5));
        assert_eq!(core.cached_temperature(Duration::ZERO), None);
    }

    #[test]
    fn test_finish_wait_outcomes() {
        let core = EngineCore::new(5, 1000);
        let timeout = Duration::from_secs(1);

        core.set_state(MovementState::MovingProgrammatic);
        assert_eq!(core.finish_wait(Ok(WaitOutcome::Completed(9)), timeout).unwrap(), 9);
        assert_eq!(core.state(), MovementState::Idle);

        core.set_state(MovementState::MovingProgrammatic);
        assert!(matches!(
            core.finish_wait(Ok(WaitOutcome::DeadlineExpired), timeout),
            Err(Error::Timeout(_))
        ));
        assert_eq!(core.state(), MovementState::Idle);

        core.set_state(MovementState::MovingProgrammatic);
        assert_eq!(core.finish_wait(Ok(WaitOutcome::Cancelled), timeout).unwrap(), 5);
        assert_eq!(core.state(), MovementState::MovingProgrammatic);
    }

    #[test]
    fn test_single_watcher_slot() {
        let core = EngineCore::new(0, 1000);
        assert!(core.claim_watcher());
        assert!(!core.claim_watcher());
        core.release_watcher();
        assert!(core.claim_watcher());
    }
}
