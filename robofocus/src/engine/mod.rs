//! Focuser engine contract and shared engine machinery.
//!
//! An engine owns the link to one focuser, real or simulated, and enforces
//! the protocol's movement discipline: while the motor runs, any byte written
//! to the device is taken as a stop request, so almost every command is
//! refused until the completion packet has been seen.
//!
//! ```text
//!            move_absolute              completion packet / stall / halt
//!   Idle ----------------------> MovingProgrammatic ----------------------> Idle
//!     |
//!     |  'I' / 'O' while reading a response      completion / 60s / halt
//!     +----------------------------------> MovingExternal ----------------> Idle
//! ```
//!
//! [`HardwareEngine`] drives a serial port, [`SimulatorEngine`] a virtual
//! device. Both run the same byte-level completion loop from [`motion`].

pub mod hardware;
pub mod motion;
mod state;
pub mod simulator;

pub use hardware::HardwareEngine;
pub use simulator::{SimulatorConfig, SimulatorEngine};

use crate::error::{Error, Result};
use crate::port::DEFAULT_TIMEOUT;
use crate::protocol::packet::MAX_VALUE;
use log::warn;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Per-byte read timeout while tracking motion.
pub const BYTE_TIMEOUT: Duration = Duration::from_millis(500);

/// Motion is considered stalled after this long without a status byte.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(3);

/// The external-move watcher gives up after this long.
pub const WATCHER_LIMIT: Duration = Duration::from_secs(60);

/// Default hard limit for `wait_for_movement_end`.
pub const MOVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Cached temperature readings are refreshed after this age.
pub const TEMPERATURE_MAX_AGE: Duration = Duration::from_secs(120);

/// Reported while moving if no temperature has ever been read.
pub const DEFAULT_TEMPERATURE: f64 = 20.0;

/// Largest travel limit the firmware accepts.
pub const MAX_TRAVEL_LIMIT: u32 = 65535;

/// Largest backlash compensation amount.
pub const MAX_BACKLASH: u32 = 255;

/// Plausible raw ADC range for the temperature probe.
pub const TEMPERATURE_RAW_RANGE: std::ops::RangeInclusive<u32> = 200..=1000;

/// Movement state of the focuser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MovementState {
    /// Not moving; all commands allowed.
    #[default]
    Idle,
    /// Moving after `move_absolute`.
    MovingProgrammatic,
    /// Moving under handset control.
    MovingExternal,
}

impl MovementState {
    /// Whether the motor is running.
    pub fn is_moving(self) -> bool {
        self != Self::Idle
    }
}

impl fmt::Display for MovementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::MovingProgrammatic => "programmatic",
            Self::MovingExternal => "external",
        })
    }
}

/// Motion direction that receives backlash compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklashDirection {
    /// Compensate on inward motion (wire digit `2`).
    In,
    /// Compensate on outward motion (wire digit `3`).
    Out,
}

impl BacklashDirection {
    /// Leading decimal digit used on the wire.
    pub fn wire_digit(self) -> u32 {
        match self {
            Self::In => 2,
            Self::Out => 3,
        }
    }
}

impl fmt::Display for BacklashDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::In => "IN",
            Self::Out => "OUT",
        })
    }
}

/// Hardware backlash setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backlash {
    /// Compensated direction.
    pub direction: BacklashDirection,
    /// Compensation in steps, 0 disables.
    pub amount: u32,
}

impl Backlash {
    /// Compensation switched off.
    pub const DISABLED: Self = Self {
        direction: BacklashDirection::Out,
        amount: 0,
    };

    /// Build a setting, rejecting amounts above [`MAX_BACKLASH`].
    pub fn new(direction: BacklashDirection, amount: u32) -> Result<Self> {
        if amount > MAX_BACKLASH {
            return Err(Error::InvalidValue(format!(
                "backlash amount must be 0-{MAX_BACKLASH}, got {amount}"
            )));
        }
        Ok(Self { direction, amount })
    }

    /// From the signed convention: positive OUT, negative IN, zero disabled.
    pub fn from_signed(value: i32) -> Result<Self> {
        let direction = if value < 0 {
            BacklashDirection::In
        } else {
            BacklashDirection::Out
        };
        Self::new(direction, value.unsigned_abs())
    }

    /// To the signed convention.
    pub fn to_signed(self) -> i32 {
        match self.direction {
            BacklashDirection::In => -(self.amount as i32),
            BacklashDirection::Out => self.amount as i32,
        }
    }

    /// Packet value: direction digit followed by a 5-digit amount.
    pub fn to_wire(self) -> u32 {
        self.direction.wire_digit() * 100_000 + self.amount
    }

    /// Parse a packet value. A direction digit other than 2 or 3 means
    /// compensation is off.
    pub fn from_wire(value: u32) -> Self {
        let amount = value % 100_000;
        match value / 100_000 {
            2 => Self {
                direction: BacklashDirection::In,
                amount,
            },
            3 => Self {
                direction: BacklashDirection::Out,
                amount,
            },
            _ => Self::DISABLED,
        }
    }
}

/// Retry budget for a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Hardware engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Serial port name/path.
    pub port_name: String,
    /// Response timeout for each command attempt.
    pub timeout: Duration,
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

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            byte_timeout: BYTE_TIMEOUT,
            stall_timeout: STALL_TIMEOUT,
            watcher_limit: WATCHER_LIMIT,
            temperature_max_age: TEMPERATURE_MAX_AGE,
        }
    }
}

impl EngineConfig {
    /// Configuration for `port_name` with default timings.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Operations every focuser engine provides.
///
/// All methods take `&self`; engines synchronize internally so a controller
/// can share one between its caller and a background completion waiter.
pub trait FocuserEngine: Send + Sync {
    /// Open the link and identify the device.
    fn connect(&self) -> Result<()>;

    /// Release the link. Any waiter is released first.
    fn disconnect(&self) -> Result<()>;

    /// Whether the link is open.
    fn is_connected(&self) -> bool;

    /// Physical position. Served from cache while moving.
    fn get_position(&self) -> Result<u32>;

    /// Start a move to `target` and return without waiting for it.
    fn move_absolute(&self, target: u32) -> Result<()>;

    /// Stop immediately. Allowed in any state.
    fn halt(&self) -> Result<()>;

    /// Block until the current move completes and return the final position.
    fn wait_for_movement_end(&self, timeout: Duration) -> Result<u32>;

    /// Current movement state.
    fn movement_state(&self) -> MovementState;

    /// Whether the motor is running.
    fn is_moving(&self) -> bool {
        self.movement_state().is_moving()
    }

    /// Temperature in Celsius.
    fn get_temperature(&self) -> Result<f64>;

    /// Read the backlash setting.
    fn get_backlash(&self) -> Result<Backlash>;

    /// Write the backlash setting.
    fn set_backlash(&self, direction: BacklashDirection, amount: u32) -> Result<()>;

    /// Read the travel limit.
    fn get_max_travel(&self) -> Result<u32>;

    /// Write the travel limit (1-65535).
    fn set_max_travel(&self, value: u32) -> Result<()>;

    /// Set the step counter to `value` without moving.
    fn sync_position(&self, value: u32) -> Result<()>;

    /// Force the state machine to `Idle` and release any waiter.
    fn force_idle(&self);

    /// Make a blocked `wait_for_movement_end` return promptly.
    fn cancel_wait(&self);

    /// Firmware version reported during connect.
    fn firmware_version(&self) -> Option<String>;

    /// Port or device identity.
    fn port_name(&self) -> String;

    /// Last known physical position, without any I/O.
    fn cached_position(&self) -> u32;
}

/// Convert a raw ADC reading to Celsius.
pub fn raw_to_celsius(raw: u32) -> Result<f64> {
    if !TEMPERATURE_RAW_RANGE.contains(&raw) {
        return Err(Error::Sensor(format!(
            "temperature sensor not responding (raw ADC {raw})"
        )));
    }
    Ok((f64::from(raw) - 380.0) / 10.0)
}

/// Convert Celsius to the raw ADC reading the probe would report.
pub fn celsius_to_raw(celsius: f64) -> u32 {
    (celsius * 10.0 + 380.0).round().max(0.0) as u32
}

pub(crate) fn validate_max_travel(value: u32) -> Result<()> {
    if value == 0 || value > MAX_TRAVEL_LIMIT {
        return Err(Error::InvalidValue(format!(
            "max travel must be 1-{MAX_TRAVEL_LIMIT}, got {value}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_position(value: u32) -> Result<()> {
    if value > MAX_VALUE {
        return Err(Error::InvalidValue(format!(
            "position must be 0-{MAX_VALUE}, got {value}"
        )));
    }
    Ok(())
}

/// `FS000000` and `FS000001` read the counter instead of setting it.
pub(crate) fn sync_wire_value(value: u32) -> u32 {
    value.max(2)
}

/// Run `attempt` until it succeeds, fails with a non-retryable error or the
/// budget is spent. `before_retry` runs between attempts.
pub(crate) fn with_retries<T>(
    policy: &RetryPolicy,
    command: &str,
    mut attempt: impl FnMut() -> Result<T>,
    mut before_retry: impl FnMut(),
) -> Result<T> {
    let max = policy.max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                if n >= max {
                    return Err(Error::MaxRetriesExceeded {
                        command: command.to_string(),
                        attempts: max,
                        last: Box::new(e),
                    });
                }
                warn!("Command {command} retry: attempt {n}/{max} failed: {e}");
                thread::sleep(policy.delay);
                before_retry();
                n += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
