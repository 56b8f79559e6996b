//! Engine for a real focuser on a serial port.
//!
//! All serial I/O goes through one mutex around the port, so a foreground
//! command and a background completion read never interleave mid-packet.
//! Waiters hold that mutex for their whole read loop; [`HardwareEngine::halt`]
//! and [`HardwareEngine::cancel_wait`] bump a wait epoch that makes them let
//! go within one per-byte timeout.

use crate::engine::motion::{self, MotionLimits, WaitOutcome};
use crate::engine::state::{EngineCore, Link, Reply};
use crate::engine::{
    Backlash, BacklashDirection, EngineConfig, FocuserEngine, MAX_TRAVEL_LIMIT, MovementState,
    RetryPolicy, lock,
};
use crate::error::{Error, Result};
use crate::port::{Port, SerialConfig};
use crate::protocol::packet::{
    self, Command, MESSAGE_LEN, PACKET_LEN, PACKET_START, STEP_IN, STEP_OUT,
};
use log::{debug, error, info, trace, warn};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[cfg(feature = "native")]
use crate::port::NativePort;

/// Pause after `FQ` before draining leftover status bytes.
const HALT_SETTLE: Duration = Duration::from_millis(200);

type PortOpener<P> = Box<dyn Fn(&SerialConfig) -> Result<P> + Send + Sync>;

struct Inner<P> {
    config: EngineConfig,
    opener: PortOpener<P>,
    port: Mutex<Option<P>>,
    core: EngineCore,
}

/// RoboFocus engine over a [`Port`].
pub struct HardwareEngine<P: Port + 'static> {
    inner: Arc<Inner<P>>,
}

#[cfg(feature = "native")]
impl HardwareEngine<NativePort> {
    /// Engine for a native serial port.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_opener(config, NativePort::open)
    }
}

impl<P: Port + 'static> HardwareEngine<P> {
    /// Engine that opens its port with `opener` on every connect.
    pub fn with_opener<F>(config: EngineConfig, opener: F) -> Self
    where
        F: Fn(&SerialConfig) -> Result<P> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                config,
                opener: Box::new(opener),
                port: Mutex::new(None),
                core: EngineCore::new(0, MAX_TRAVEL_LIMIT),
            }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl<P: Port + 'static> Link for Inner<P> {
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
        let mut guard = lock(&self.port);
        let port = guard.as_mut().ok_or(Error::NotConnected)?;

        // Input is drained after each complete response, not before a request.
        port.clear_output()?;
        trace!("TX: {}", packet::hex(&request));
        port.write_all_bytes(&request)?;

        self.read_response(port, command)
    }

    fn flush(&self) {
        if let Some(port) = lock(&self.port).as_mut() {
            let _ = port.clear_buffers();
        }
    }
}

impl<P: Port + 'static> Inner<P> {
    fn read_response(self: &Arc<Self>, port: &mut P, command: Command) -> Result<Reply> {
        port.set_timeout(self.config.timeout)?;
        loop {
            let Some(byte) = port.read_byte()? else {
                if self.core.state() == MovementState::MovingExternal {
                    return Ok(Reply::Pending);
                }
                return Err(Error::Timeout(format!("no response to {command}")));
            };

            match byte {
                STEP_IN | STEP_OUT => {
                    let direction = if byte == STEP_IN { "inward" } else { "outward" };
                    info!("External movement detected ({direction})");
                    self.core.set_state(MovementState::MovingExternal);
                    self.spawn_watcher();
                    return Ok(Reply::Pending);
                },
                PACKET_START => {
                    let mut raw = [0u8; PACKET_LEN];
                    raw[0] = PACKET_START;
                    let n = port.read_up_to(&mut raw[1..])?;
                    if n < MESSAGE_LEN {
                        return Err(Error::Protocol(format!(
                            "incomplete response to {command}: received {}/{PACKET_LEN} bytes",
                            n + 1
                        )));
                    }
                    trace!("RX: {}", packet::hex(&raw));

                    let reply = packet::decode(&raw)?.validated()?;
                    if reply.is_position_report() {
                        let position = reply.value.as_u32();
                        self.core.set_position(position);
                        if self
                            .core
                            .transition(MovementState::MovingExternal, MovementState::Idle)
                        {
                            info!("External movement finished at position {position}");
                        }
                    }
                    port.clear_input()?;
                    return Ok(Reply::Packet(reply));
                },
                other => warn!("Unexpected byte: 0x{other:02X}"),
            }
        }
    }

    fn spawn_watcher(self: &Arc<Self>) {
        if !self.core.claim_watcher() {
            return;
        }
        let inner = Arc::clone(self);
        let epoch = self.core.wait_epoch();
        let spawned = thread::Builder::new()
            .name("robofocus-watcher".into())
            .spawn(move || {
                inner.watch_external_movement(epoch);
                inner.core.release_watcher();
            });
        if let Err(e) = spawned {
            error!("Failed to start external movement watcher: {e}");
            self.core.release_watcher();
            self.core.set_state(MovementState::Idle);
        }
    }

    fn watch_external_movement(&self, epoch: u64) {
        debug!("External movement watcher started");
        let limits = MotionLimits {
            stall_timeout: None,
            deadline: self.config.watcher_limit,
        };

        let outcome = {
            let mut guard = lock(&self.port);
            match guard.as_mut() {
                Some(port) => port.set_timeout(self.config.byte_timeout).and_then(|()| {
                    let outcome = motion::track(port, self.core.position_cell(), &limits, || {
                        self.core.watcher_cancelled(epoch)
                    })?;
                    if outcome == WaitOutcome::DeadlineExpired {
                        port.clear_input()?;
                    }
                    Ok(outcome)
                }),
                None => Err(Error::NotConnected),
            }
        };
        self.core.finish_watch(outcome);
    }

    fn wait_for_programmatic(&self, timeout: Duration) -> Result<u32> {
        let epoch = self.core.move_epoch();
        debug!("Waiting for movement to end (timeout: {}s)", timeout.as_secs());
        let limits = MotionLimits {
            stall_timeout: Some(self.config.stall_timeout),
            deadline: timeout,
        };

        let outcome = {
            let mut guard = lock(&self.port);
            let port = guard.as_mut().ok_or(Error::NotConnected)?;
            port.set_timeout(self.config.byte_timeout)?;
            motion::track(port, self.core.position_cell(), &limits, || {
                self.core.programmatic_cancelled(epoch)
            })
        };
        self.core.finish_wait(outcome, timeout)
    }

    fn close_port(&self) {
        if let Some(mut port) = lock(&self.port).take() {
            if let Err(e) = port.close() {
                warn!("Error closing {}: {e}", self.config.port_name);
            }
        }
    }

    fn fail_connect(&self, err: Error) -> Error {
        self.core.set_connected(false);
        self.close_port();
        err
    }
}

impl<P: Port + 'static> FocuserEngine for HardwareEngine<P> {
    fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.core.is_connected() {
            warn!("Already connected");
            return Ok(());
        }

        info!("Opening serial port {}", inner.config.port_name);
        let serial = SerialConfig::new(&inner.config.port_name).with_timeout(inner.config.timeout);
        let mut port = (inner.opener)(&serial)?;
        port.clear_buffers()?;
        *lock(&inner.port) = Some(port);
        inner.core.set_state(MovementState::Idle);
        inner.core.set_connected(true);

        let handshake = inner.exchange(Command::VERSION, 0).and_then(|reply| match reply {
            Reply::Packet(p) if p.command == Command::VERSION => Ok(p),
            Reply::Packet(p) => Err(Error::Protocol(format!("unexpected {} reply", p.command))),
            Reply::Pending => Err(Error::Protocol("step bytes instead of a reply".into())),
        });
        let version = match handshake {
            Ok(reply) => reply.value.to_version_string(),
            Err(e) => {
                return Err(inner.fail_connect(Error::Handshake(format!(
                    "hardware did not respond to FV command, wrong device? ({e})"
                ))));
            },
        };
        inner.core.set_firmware(Some(version.clone()));

        match inner.exchange(Command::GOTO, 0) {
            Ok(Reply::Packet(p)) if p.command == Command::POSITION => {},
            Ok(Reply::Packet(p)) => warn!("Unexpected response to FG query: {}", p.command),
            Ok(Reply::Pending) => info!("Focuser is moving under handset control"),
            Err(e) => {
                return Err(inner.fail_connect(Error::Handshake(format!(
                    "initial position query failed: {e}"
                ))));
            },
        }

        info!(
            "Connected to RoboFocus (firmware: {version}, position: {})",
            inner.core.position()
        );
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.core.set_connected(false) {
            return Ok(());
        }
        inner.core.cancel_waiters();
        inner.close_port();
        inner.core.set_state(MovementState::Idle);
        inner.core.clear_caches();
        info!("Serial port closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected() && lock(&self.inner.port).is_some()
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

        let sent = {
            let mut guard = lock(&inner.port);
            guard
                .as_mut()
                .ok_or(Error::NotConnected)
                .and_then(|port| {
                    port.clear_buffers()?;
                    trace!("TX: {}", packet::hex(&request));
                    port.write_all_bytes(&request)
                })
        };
        if let Err(e) = sent {
            inner.core.set_state(MovementState::Idle);
            return Err(e);
        }
        debug!("Move command sent to position {target}");
        Ok(())
    }

    fn halt(&self) -> Result<()> {
        let inner = &self.inner;
        inner.core.ensure_connected()?;
        info!("Halting movement");

        // Release any waiter so the port lock frees up.
        inner.core.cancel_waiters();
        let request = packet::encode(Command::HALT, 0)?;
        {
            let mut guard = lock(&inner.port);
            let port = guard.as_mut().ok_or(Error::NotConnected)?;
            port.clear_buffers()?;
            trace!("TX: {}", packet::hex(&request));
            port.write_all_bytes(&request)?;
            thread::sleep(HALT_SETTLE);
            port.clear_input()?;
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
        self.inner.config.port_name.clone()
    }

    fn cached_position(&self) -> u32 {
        self.inner.core.position()
    }
}

impl<P: Port + 'static> Drop for HardwareEngine<P> {
    fn drop(&mut self) {
        // A running watcher holds its own Arc; the last handle shuts things down.
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.disconnect();
        }
    }
}
