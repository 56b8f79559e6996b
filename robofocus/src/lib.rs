//! # robofocus
//!
//! A driver core for RoboFocus motorized focusers on RS-232.
//!
//! This crate provides:
//!
//! - The 9-byte framing codec with its additive checksum
//! - Port enumeration and handshake-based device discovery
//! - A hardware engine with the movement state machine, command discipline,
//!   retries and caching
//! - A simulator engine with the same contract and fault injection
//! - A controller adding logical positions, move validation and persisted
//!   calibration
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization for settings and port info
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use robofocus::{FocuserController, MemoryStore, SimulatorEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(SimulatorEngine::default());
//!     let controller = FocuserController::new(engine, Arc::new(MemoryStore::default()))?;
//!     controller.connect()?;
//!
//!     controller.move_to(1500)?;
//!     while controller.is_moving() {
//!         std::thread::sleep(std::time::Duration::from_millis(100));
//!     }
//!     println!("Now at {}", controller.get_position()?);
//!
//!     controller.disconnect()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod device;
pub mod engine;
pub mod error;
pub mod port;
pub mod protocol;
pub mod settings;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    controller::FocuserController,
    device::DiscoveredDevice,
    engine::{
        Backlash, BacklashDirection, EngineConfig, FocuserEngine, HardwareEngine, MovementState,
        RetryPolicy, SimulatorConfig, SimulatorEngine,
    },
    error::{Error, Result},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Command, Packet, Value},
    settings::{FocuserSettings, MemoryStore, SettingsStore},
};
