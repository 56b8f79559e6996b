//! Persisted focuser settings and the store they are saved through.
//!
//! Hardware-resident values (`max_step`, `backlash`, `firmware_version`) are
//! mirrored here so a client can show them while disconnected; the software
//! limits (`zero_offset`, `min_step`, `max_increment`) live only here.

use crate::engine::{MAX_BACKLASH, MAX_TRAVEL_LIMIT};
use crate::error::{Error, Result};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default travel limit and per-move increment.
pub const DEFAULT_MAX_STEP: u32 = 60_000;

/// Focuser preferences that survive restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct FocuserSettings {
    /// Physical position reported as logical zero.
    pub zero_offset: u32,
    /// Lowest logical position a move may target.
    pub min_step: u32,
    /// Largest distance a single move may cover.
    pub max_increment: u32,
    /// Physical travel limit, refreshed from the hardware on connect.
    pub max_step: u32,
    /// Signed backlash compensation: positive OUT, negative IN, zero off.
    pub backlash: i32,
    /// Firmware version seen on the last connect.
    pub firmware_version: Option<String>,
}

impl Default for FocuserSettings {
    fn default() -> Self {
        Self {
            zero_offset: 0,
            min_step: 0,
            max_increment: DEFAULT_MAX_STEP,
            max_step: DEFAULT_MAX_STEP,
            backlash: 0,
            firmware_version: None,
        }
    }
}

impl FocuserSettings {
    /// Highest logical position a move may target.
    pub fn logical_max(&self) -> i32 {
        self.max_step as i32 - self.zero_offset as i32
    }

    /// Physical position to logical.
    pub fn to_logical(&self, physical: u32) -> i32 {
        physical as i32 - self.zero_offset as i32
    }

    /// Logical position to physical; fails below physical zero.
    pub fn to_physical(&self, logical: i32) -> Result<u32> {
        u32::try_from(i64::from(logical) + i64::from(self.zero_offset)).map_err(|_| {
            Error::InvalidValue(format!(
                "position {logical} is below physical zero (zero offset {})",
                self.zero_offset
            ))
        })
    }

    /// Check the settings are mutually consistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_step == 0 || self.max_step > MAX_TRAVEL_LIMIT {
            return Err(Error::InvalidValue(format!(
                "max_step must be within [1, {MAX_TRAVEL_LIMIT}], got {}",
                self.max_step
            )));
        }
        if self.max_increment == 0 {
            return Err(Error::InvalidValue("max_increment must be at least 1".into()));
        }
        if self.zero_offset > self.max_step {
            return Err(Error::InvalidValue(format!(
                "zero_offset {} exceeds max_step {}",
                self.zero_offset, self.max_step
            )));
        }
        if i64::from(self.min_step) >= i64::from(self.logical_max()) {
            return Err(Error::InvalidValue(format!(
                "min_step {} must be below the logical maximum {}",
                self.min_step,
                self.logical_max()
            )));
        }
        if self.backlash.unsigned_abs() > MAX_BACKLASH {
            return Err(Error::InvalidValue(format!(
                "backlash must be within [-{MAX_BACKLASH}, {MAX_BACKLASH}], got {}",
                self.backlash
            )));
        }
        Ok(())
    }

    /// Pull `zero_offset` and `min_step` back inside a shrunken `max_step`.
    pub fn fit_to_max_step(&mut self) {
        let max_step = self.max_step.max(1);
        self.zero_offset = self.zero_offset.min(max_step - 1);
        let highest_min = (max_step - self.zero_offset).saturating_sub(1);
        self.min_step = self.min_step.min(highest_min);
    }
}

/// Where the controller loads and saves [`FocuserSettings`].
pub trait SettingsStore: Send + Sync {
    /// Load stored settings, or defaults if nothing was saved yet.
    fn load(&self) -> Result<FocuserSettings>;

    /// Persist `settings`.
    fn save(&self, settings: &FocuserSettings) -> Result<()>;
}

/// Settings kept in memory, for tests and embedders without persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    settings: Mutex<FocuserSettings>,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Store seeded with `settings`.
    pub fn new(settings: FocuserSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            saves: AtomicUsize::new(0),
        }
    }

    /// Last saved settings.
    pub fn snapshot(&self) -> FocuserSettings {
        crate::engine::lock(&self.settings).clone()
    }

    /// Number of saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<FocuserSettings> {
        Ok(self.snapshot())
    }

    fn save(&self, settings: &FocuserSettings) -> Result<()> {
        *crate::engine::lock(&self.settings) = settings.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
